use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::fileformat::CountMatrix;


/// Stages a batch passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Loaded,
    QcFiltered,
    DoubletFiltered,
    Merged,
    GeneFiltered,
}


#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    pub batch: String,
    pub stage: Stage,
    pub cells: usize,
    pub genes: usize,
    pub cells_excluding_control: Option<usize>,
}


/**
 * Cell counts after each stage. The control count is only known when the
 * phenotype column exists in the matrix
 */
#[derive(Debug, Default)]
pub struct StageStats {
    phenotype_key: String,
    control_label: String,
    pub records: Vec<StageRecord>,
}
impl StageStats {

    pub fn new(phenotype_key: &str, control_label: &str) -> StageStats {
        StageStats {
            phenotype_key: phenotype_key.to_string(),
            control_label: control_label.to_string(),
            records: Vec::new(),
        }
    }

    pub fn record(&mut self, batch: &str, stage: Stage, mat: &CountMatrix) {
        let cells_excluding_control = self.count_excluding_control(mat);
        self.record_parts(batch, stage, mat.n_obs(), mat.n_vars(), cells_excluding_control);
    }

    /// For a batch split into several units
    pub fn record_parts(
        &mut self,
        batch: &str,
        stage: Stage,
        cells: usize,
        genes: usize,
        cells_excluding_control: Option<usize>
    ) {
        self.records.push(StageRecord {
            batch: batch.to_string(),
            stage,
            cells,
            genes,
            cells_excluding_control,
        });
    }

    pub fn count_excluding_control(&self, mat: &CountMatrix) -> Option<usize> {
        mat.obs.get(&self.phenotype_key).map(|col| {
            col.to_labels().iter().filter(|l| **l != self.control_label).count()
        })
    }

    pub fn write_tsv(&self, p: &Path) -> anyhow::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(p)
            .with_context(|| format!("Could not create stats file {}", p.display()))?;
        for r in &self.records {
            writer.serialize(r)?;
        }
        writer.flush()?;
        Ok(())
    }
}
