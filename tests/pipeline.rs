use std::path::{Path, PathBuf};

use cellclean::command::filter::{DEFAULT_EXCLUDE_PHENOTYPE, DEFAULT_PHENOTYPE_KEY};
use cellclean::command::{CellClean, CellCleanParams, DoubletMethod};
use cellclean::doublet::{DoubletCalls, DoubletDetector, OBS_IS_DOUBLET};
use cellclean::fileformat::{read_h5ad, write_h5ad, ColumnData, CountMatrix};
use cellclean::merge::DEFAULT_BATCH_KEY;
use cellclean::qc::{GeneFilterParams, QcThresholds, DEFAULT_MT_PREFIX};

const NUM_CELLS: usize = 100;
const NUM_MT: usize = 5;
const NUM_GENES: usize = 50;


/// Flags cells whose name ends in a number divisible by ten
#[derive(Debug)]
struct NameDetector;
impl DoubletDetector for NameDetector {
    fn detect(&self, unit: &CountMatrix) -> anyhow::Result<DoubletCalls> {
        let is_doublet: Vec<bool> = unit
            .obs_names
            .iter()
            .map(|n| n.rsplit('_').next().and_then(|i| i.parse::<usize>().ok()).is_some_and(|i| i % 10 == 0))
            .collect();
        let scores = is_doublet.iter().map(|&d| if d { 0.8 } else { 0.05 }).collect();
        Ok(DoubletCalls { scores, is_doublet })
    }
}


/**
 * 100 cells x 50 genes, of which MT-1..MT-5 are mitochondrial. Every fourth cell
 * is good; the others have too much mt, too few genes, or too many counts
 */
fn synthetic_batch(all_high_mt: bool) -> CountMatrix {
    let mut genes: Vec<String> = (1..=NUM_MT).map(|i| format!("MT-{}", i)).collect();
    genes.extend((NUM_MT + 1..=NUM_GENES).map(|i| format!("GENE{}", i)));

    let mut entries = Vec::new();
    for c in 0..NUM_CELLS {
        let kind = if all_high_mt { 1 } else { c % 4 };
        match kind {
            0 => {
                (0..NUM_MT).for_each(|g| entries.push((c, g, 1.0)));
                (NUM_MT..NUM_GENES).for_each(|g| entries.push((c, g, 10.0)));
            }
            1 => {
                (0..NUM_MT).for_each(|g| entries.push((c, g, 20.0)));
                (NUM_MT..NUM_GENES).for_each(|g| entries.push((c, g, 10.0)));
            }
            2 => {
                (NUM_MT..NUM_MT + 10).for_each(|g| entries.push((c, g, 10.0)));
            }
            _ => {
                (0..NUM_MT).for_each(|g| entries.push((c, g, 1.0)));
                (NUM_MT..NUM_GENES).for_each(|g| entries.push((c, g, 200.0)));
            }
        }
    }

    let mut m = CountMatrix::from_triplets(
        (0..NUM_CELLS).map(|i| format!("cell_{}", i)).collect(),
        genes,
        &entries,
    ).unwrap();
    let pheno = (0..NUM_CELLS).map(|i| if i % 8 == 0 { "BD" } else { "AD" }.to_string()).collect();
    m.set_obs(DEFAULT_PHENOTYPE_KEY, ColumnData::Strings(pheno)).unwrap();
    m
}


fn params(dir: &Path, inputs: Vec<PathBuf>) -> CellCleanParams {
    CellCleanParams {
        path_in: inputs,
        path_out: dir.join("cleaned.h5ad"),
        path_out_subset: Some(dir.join("cleaned_no_bd.h5ad")),
        path_tmp: dir.join("temp"),
        path_stats: Some(dir.join("stats.tsv")),
        phenotype_key: DEFAULT_PHENOTYPE_KEY.to_string(),
        exclude_phenotype: DEFAULT_EXCLUDE_PHENOTYPE.to_string(),
        group_by: None,
        mt_prefix: DEFAULT_MT_PREFIX.to_string(),
        qc: QcThresholds { min_genes: 20, max_pct_mt: 10.0, max_total_counts: 5000.0 },
        genes: GeneFilterParams::default(),
        batch_key: Some(DEFAULT_BATCH_KEY.to_string()),
        doublets: DoubletMethod::Skip,
    }
}


fn write_batches(dir: &Path, batches: &[CountMatrix]) -> Vec<PathBuf> {
    batches
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let p = dir.join(format!("input_sce_Batch{}.h5ad", i + 1));
            write_h5ad(m, &p).unwrap();
            p
        })
        .collect()
}


#[test]
fn two_batches_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_batches(dir.path(), &[synthetic_batch(false), synthetic_batch(false)]);
    let p = params(dir.path(), inputs);

    let stats = CellClean::run_with_detector(&p, Some(&NameDetector as &dyn DoubletDetector)).unwrap();

    //25 good cells per batch, 5 of them flagged as doublets
    let out = read_h5ad(&p.path_out).unwrap();
    assert_eq!(out.n_obs(), 40);
    //round(0.001 * 40) = 0, so no gene is removed
    assert_eq!(out.n_vars(), NUM_GENES);

    let mut sorted = out.obs_names.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 40);
    assert_eq!(out.obs_names[0], "cell_4");
    assert_eq!(out.obs_names[20], "cell_4-1");

    assert_eq!(out.obs.get(OBS_IS_DOUBLET), Some(&ColumnData::Boolean(vec![false; 40])));
    let batches = out.obs_labels(DEFAULT_BATCH_KEY).unwrap();
    assert_eq!(batches.iter().filter(|b| *b == "input_sce_Batch1").count(), 20);

    let subset = read_h5ad(p.path_out_subset.as_ref().unwrap()).unwrap();
    assert_eq!(subset.n_obs(), 20);
    assert!(subset.obs_labels(DEFAULT_PHENOTYPE_KEY).unwrap().iter().all(|l| l == "AD"));

    //loaded, qc and doublet stage per batch, then merged and gene filtered
    assert_eq!(stats.records.len(), 8);
    let stats_text = std::fs::read_to_string(p.path_stats.as_ref().unwrap()).unwrap();
    assert_eq!(stats_text.lines().count(), 9);
    assert!(stats_text.contains("input_sce_Batch1\tqc_filtered\t25\t50\t12"));
}


#[test]
fn batch_without_survivors_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_batches(dir.path(), &[synthetic_batch(false), synthetic_batch(true)]);
    let p = params(dir.path(), inputs);

    CellClean::run_with_detector(&p, Some(&NameDetector as &dyn DoubletDetector)).unwrap();

    let out = read_h5ad(&p.path_out).unwrap();
    assert_eq!(out.n_obs(), 20);
    assert!(out.obs_labels(DEFAULT_BATCH_KEY).unwrap().iter().all(|b| b == "input_sce_Batch1"));
}


#[test]
fn nothing_passing_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_batches(dir.path(), &[synthetic_batch(false), synthetic_batch(false)]);
    let mut p = params(dir.path(), inputs);
    p.qc = QcThresholds::default();

    let err = CellClean::run_with_detector(&p, Some(&NameDetector as &dyn DoubletDetector)).unwrap_err();
    assert!(err.to_string().contains("No cells passed filtering"));
    assert!(!p.path_out.exists());
}


#[test]
fn skipping_doublets_keeps_qc_survivors() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_batches(dir.path(), &[synthetic_batch(false)]);
    let mut p = params(dir.path(), inputs);
    p.path_out_subset = None;
    p.batch_key = None;

    CellClean::run(&p).unwrap();

    let out = read_h5ad(&p.path_out).unwrap();
    assert_eq!(out.n_obs(), 25);
    assert!(!out.obs.contains(DEFAULT_BATCH_KEY));
    assert!(!p.path_tmp.exists());
}
