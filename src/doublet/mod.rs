pub mod script;
pub mod presets;

use std::collections::HashMap;
use std::fmt::Debug;

use anyhow::{bail, Context};
use log::{debug, info};

use crate::fileformat::{ColumnData, CountMatrix};

pub use script::ScriptDoubletDetector;

pub const OBS_DOUBLET_SCORE: &str = "scrublet_doublet_scores";
pub const OBS_IS_DOUBLET: &str = "scrublet_is_doublet";


/**
 * Output of a doublet detector, aligned with the rows it was given
 */
#[derive(Debug, Clone, PartialEq)]
pub struct DoubletCalls {
    pub scores: Vec<f64>,
    pub is_doublet: Vec<bool>,
}
impl DoubletCalls {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn num_doublets(&self) -> usize {
        self.is_doublet.iter().filter(|d| **d).count()
    }
}


/**
 * Anything that can score cells for being doublets. It is given the counts of one
 * homogeneous unit (a batch, or one group of a batch) at a time, and must return
 * one score and one call per cell in the same order. Results need not be deterministic
 */
pub trait DoubletDetector where Self: Debug {
    fn detect(&self, unit: &CountMatrix) -> anyhow::Result<DoubletCalls>;
}


/**
 * Split cells into the units doublet detection runs on. Without a grouping column
 * the whole matrix is one unit. Groups come out in ascending label order
 */
pub fn split_units(mat: &CountMatrix, group_by: Option<&str>) -> anyhow::Result<Vec<(String, Vec<usize>)>> {
    let Some(key) = group_by else {
        return Ok(vec![(String::new(), (0..mat.n_obs()).collect())]);
    };

    let column = match mat.obs.get(key) {
        Some(c) => c,
        None => bail!("Cannot group cells by '{}': no such annotation. Available: {:?}", key, mat.obs.names()),
    };
    let labels = column.to_labels();

    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    let mut group_index: HashMap<&str, usize> = HashMap::new();
    for (i, label) in labels.iter().enumerate() {
        let g = *group_index.entry(label.as_str()).or_insert_with(|| {
            groups.push((label.clone(), Vec::new()));
            groups.len() - 1
        });
        groups[g].1.push(i);
    }

    //Numbers sort as numbers, like np.unique would. Categorical labels were decoded
    //to text, so labels that all parse as numbers are treated the same way
    match column {
        ColumnData::Numeric(values) => {
            groups.sort_by(|a, b| values[a.1[0]].total_cmp(&values[b.1[0]]));
        }
        _ => {
            let parsed: Option<Vec<f64>> = groups.iter().map(|(l, _)| l.trim().parse::<f64>().ok()).collect();
            match parsed {
                Some(numbers) => {
                    let mut keyed: Vec<(f64, (String, Vec<usize>))> = numbers.into_iter().zip(groups).collect();
                    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
                    groups = keyed.into_iter().map(|(_, g)| g).collect();
                }
                None => groups.sort_by(|a, b| a.0.cmp(&b.0)),
            }
        }
    }
    Ok(groups)
}


/**
 * Run the detector on one unit and keep only the singlets. Scores and calls are
 * annotated on the cells before filtering
 */
pub fn remove_doublets_in_unit(
    mut unit: CountMatrix,
    detector: &dyn DoubletDetector
) -> anyhow::Result<CountMatrix> {
    let calls = detector.detect(&unit)?;
    if calls.scores.len() != unit.n_obs() || calls.is_doublet.len() != unit.n_obs() {
        bail!(
            "Doublet detector returned {} scores and {} calls for {} cells",
            calls.scores.len(), calls.is_doublet.len(), unit.n_obs()
        );
    }

    let keep: Vec<bool> = calls.is_doublet.iter().map(|d| !d).collect();
    let num_doublets = calls.num_doublets();
    unit.set_obs(OBS_DOUBLET_SCORE, ColumnData::Numeric(calls.scores))?;
    unit.set_obs(OBS_IS_DOUBLET, ColumnData::Boolean(calls.is_doublet))?;

    let singlets = unit.filter_obs(&keep)?;
    debug!("Removed {} doublets of {} cells", num_doublets, unit.n_obs());
    Ok(singlets)
}


/**
 * Doublet removal for one batch. Each unit is scored in isolation; the filtered
 * units are returned in order, ready to be merged with the other batches.
 * Empty units are skipped without calling the detector
 */
pub fn remove_doublets(
    mat: &CountMatrix,
    detector: &dyn DoubletDetector,
    group_by: Option<&str>
) -> anyhow::Result<Vec<CountMatrix>> {
    let mut out = Vec::new();
    for (label, rows) in split_units(mat, group_by)? {
        if rows.is_empty() {
            info!("No cells to check for doublets; skipping");
            continue;
        }
        if group_by.is_some() {
            info!("Doublet detection for group {} ({} cells)", label, rows.len());
        }
        let unit = mat.select_obs(&rows);
        let singlets = remove_doublets_in_unit(unit, detector)
            .with_context(|| format!("Doublet detection failed for unit '{}'", label))?;
        info!("Doublet filter kept {} of {} cells", singlets.n_obs(), rows.len());
        out.push(singlets);
    }
    Ok(out)
}
