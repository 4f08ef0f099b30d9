use log::info;

use super::metrics::{annotate_qc_metrics, CellMetrics};
use crate::fileformat::CountMatrix;

pub const DEFAULT_MIN_GENES: usize = 1000;
pub const DEFAULT_MAX_PCT_MT: f64 = 10.0;
pub const DEFAULT_MAX_TOTAL_COUNTS: f64 = 50000.0;


/**
 * Cell QC thresholds. All bounds are inclusive
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QcThresholds {
    pub min_genes: usize,
    pub max_pct_mt: f64,
    pub max_total_counts: f64,
}
impl Default for QcThresholds {
    fn default() -> Self {
        Self {
            min_genes: DEFAULT_MIN_GENES,
            max_pct_mt: DEFAULT_MAX_PCT_MT,
            max_total_counts: DEFAULT_MAX_TOTAL_COUNTS,
        }
    }
}
impl QcThresholds {

    /// NaN mitochondrial percentage (a cell without counts) never passes
    pub fn passes(&self, n_genes: usize, pct_mt: f64, total_counts: f64) -> bool {
        n_genes >= self.min_genes && pct_mt <= self.max_pct_mt && total_counts <= self.max_total_counts
    }

    pub fn mask(&self, metrics: &CellMetrics) -> Vec<bool> {
        metrics.n_genes_by_counts.iter()
            .zip(metrics.pct_counts_flagged.iter())
            .zip(metrics.total_counts.iter())
            .map(|((&n_genes, &pct), &total)| self.passes(n_genes, pct, total))
            .collect()
    }
}


/**
 * Annotate QC metrics on every cell, then keep the cells passing all thresholds.
 * The returned matrix carries the metrics of the surviving cells
 */
pub fn filter_cells(
    mut mat: CountMatrix,
    thresholds: &QcThresholds,
    mt_prefix: &str
) -> anyhow::Result<CountMatrix> {
    let metrics = annotate_qc_metrics(&mut mat, mt_prefix)?;
    let keep = thresholds.mask(&metrics);
    let filtered = mat.filter_obs(&keep)?;
    info!(
        "QC kept {} of {} cells (min genes {}, max mt% {}, max total counts {})",
        filtered.n_obs(), mat.n_obs(), thresholds.min_genes, thresholds.max_pct_mt, thresholds.max_total_counts
    );
    Ok(filtered)
}



#[cfg(test)]
mod tests {
    use super::*;
    use crate::qc::metrics::{OBS_PCT_COUNTS_MT, OBS_TOTAL_COUNTS};
    use crate::fileformat::ColumnData;

    /**
     * Cells built to sit on either side of each threshold:
     *  ok           1000 genes, 0 mt, 1000 total
     *  genes_low     999 genes
     *  mt_edge      exactly 10% mt
     *  mt_over      just above 10% mt
     *  total_edge   exactly 50000 total
     *  total_over   above 50000 total
     */
    fn boundary_matrix() -> CountMatrix {
        let n_genes = 1001;
        let mut var_names: Vec<String> = vec!["MT-CO1".to_string()];
        var_names.extend((1..n_genes).map(|i| format!("G{}", i)));

        let cells = ["ok", "genes_low", "mt_edge", "mt_over", "total_edge", "total_over"];
        let mut entries = Vec::new();

        //ok: genes 1..=1000, one count each
        for g in 1..=1000 { entries.push((0, g, 1.0)); }
        //genes_low: 999 genes
        for g in 1..=999 { entries.push((1, g, 1.0)); }
        //mt_edge: 1000 non-mt genes, 9 counts each = 9000, mt = 1000 -> 10%
        for g in 1..=1000 { entries.push((2, g, 9.0)); }
        entries.push((2, 0, 1000.0));
        //mt_over: mt = 1001 of 10001
        for g in 1..=1000 { entries.push((3, g, 9.0)); }
        entries.push((3, 0, 1001.0));
        //total_edge: 1000 genes, 50 each = 50000
        for g in 1..=1000 { entries.push((4, g, 50.0)); }
        //total_over: 50051
        for g in 1..=1000 { entries.push((5, g, 50.0)); }
        entries.push((5, 1000, 51.0));

        CountMatrix::from_triplets(cells.iter().map(|s| s.to_string()).collect(), var_names, &entries).unwrap()
    }

    #[test]
    fn boundaries_are_inclusive() {
        let filtered = filter_cells(boundary_matrix(), &QcThresholds::default(), "MT-").unwrap();
        assert_eq!(filtered.obs_names, vec!["ok", "mt_edge", "total_edge"]);
    }

    #[test]
    fn survivors_satisfy_all_thresholds() {
        let t = QcThresholds::default();
        let filtered = filter_cells(boundary_matrix(), &t, "MT-").unwrap();
        let Some(ColumnData::Numeric(pct)) = filtered.obs.get(OBS_PCT_COUNTS_MT) else { panic!("no mt%") };
        let Some(ColumnData::Numeric(total)) = filtered.obs.get(OBS_TOTAL_COUNTS) else { panic!("no totals") };
        assert!(pct.iter().all(|&p| p <= t.max_pct_mt));
        assert!(total.iter().all(|&c| c <= t.max_total_counts));
    }

    #[test]
    fn filtering_twice_removes_nothing_more() {
        let t = QcThresholds::default();
        let once = filter_cells(boundary_matrix(), &t, "MT-").unwrap();
        let twice = filter_cells(once.clone(), &t, "MT-").unwrap();
        assert_eq!(once.obs_names, twice.obs_names);
    }

    #[test]
    fn all_cells_failing_mt_gives_empty_matrix() {
        let var_names = vec!["MT-CO1".to_string(), "G1".to_string()];
        let entries: Vec<(usize, usize, f64)> = (0..5).flat_map(|c| vec![(c, 0, 50.0), (c, 1, 50.0)]).collect();
        let m = CountMatrix::from_triplets((0..5).map(|i| format!("c{}", i)).collect(), var_names, &entries).unwrap();
        let t = QcThresholds { min_genes: 1, ..QcThresholds::default() };
        let filtered = filter_cells(m, &t, "MT-").unwrap();
        assert_eq!(filtered.n_obs(), 0);
        assert_eq!(filtered.n_vars(), 2);
    }

    #[test]
    fn cell_without_counts_fails() {
        let t = QcThresholds { min_genes: 0, ..QcThresholds::default() };
        assert!(!t.passes(0, f64::NAN, 0.0));
    }
}
