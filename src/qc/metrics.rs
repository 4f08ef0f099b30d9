use log::debug;
use sprs::CsMat;

use crate::fileformat::{ColumnData, CountMatrix};

pub const DEFAULT_MT_PREFIX: &str = "MT-";

/// Name of the gene set; gives the suffix of the cell metrics below
pub const QC_VAR_MT: &str = "mt";

pub const OBS_N_GENES_BY_COUNTS: &str = "n_genes_by_counts";
pub const OBS_TOTAL_COUNTS: &str = "total_counts";
pub const OBS_TOTAL_COUNTS_MT: &str = "total_counts_mt";
pub const OBS_PCT_COUNTS_MT: &str = "pct_counts_mt";

pub const VAR_N_CELLS_BY_COUNTS: &str = "n_cells_by_counts";
pub const VAR_MEAN_COUNTS: &str = "mean_counts";
pub const VAR_PCT_DROPOUT_BY_COUNTS: &str = "pct_dropout_by_counts";
pub const VAR_TOTAL_COUNTS: &str = "total_counts";


/**
 * Per-cell quality metrics, one entry per cell
 */
#[derive(Debug, Clone, PartialEq)]
pub struct CellMetrics {
    pub n_genes_by_counts: Vec<usize>,
    pub total_counts: Vec<f64>,
    pub total_counts_flagged: Vec<f64>,
    pub pct_counts_flagged: Vec<f64>,
}


/**
 * Per-gene quality metrics, one entry per gene
 */
#[derive(Debug, Clone, PartialEq)]
pub struct GeneMetrics {
    pub n_cells_by_counts: Vec<usize>,
    pub mean_counts: Vec<f64>,
    pub pct_dropout_by_counts: Vec<f64>,
    pub total_counts: Vec<f64>,
}


/// Genes whose name starts with the prefix. Case sensitive
pub fn flag_genes_with_prefix(var_names: &[String], prefix: &str) -> Vec<bool> {
    var_names.iter().map(|g| g.starts_with(prefix)).collect()
}


/**
 * Sum counts, count detected genes and the share of counts from flagged genes.
 * A cell without counts gets NaN percentage
 */
pub fn compute_cell_metrics(x: &CsMat<f64>, flagged: &[bool]) -> CellMetrics {
    let n = x.rows();
    let mut metrics = CellMetrics {
        n_genes_by_counts: Vec::with_capacity(n),
        total_counts: Vec::with_capacity(n),
        total_counts_flagged: Vec::with_capacity(n),
        pct_counts_flagged: Vec::with_capacity(n),
    };

    for row in x.outer_iterator() {
        let mut n_genes = 0;
        let mut total = 0.0;
        let mut total_flagged = 0.0;
        for (gene, &v) in row.iter() {
            if v != 0.0 {
                n_genes += 1;
            }
            total += v;
            if flagged[gene] {
                total_flagged += v;
            }
        }
        metrics.n_genes_by_counts.push(n_genes);
        metrics.total_counts.push(total);
        metrics.total_counts_flagged.push(total_flagged);
        metrics.pct_counts_flagged.push(if total > 0.0 { 100.0 * total_flagged / total } else { f64::NAN });
    }
    metrics
}


pub fn compute_gene_metrics(x: &CsMat<f64>) -> GeneMetrics {
    let n_obs = x.rows();
    let n_vars = x.cols();
    let mut n_cells = vec![0usize; n_vars];
    let mut totals = vec![0.0f64; n_vars];
    for row in x.outer_iterator() {
        for (gene, &v) in row.iter() {
            if v != 0.0 {
                n_cells[gene] += 1;
            }
            totals[gene] += v;
        }
    }

    let n_obs_f = n_obs as f64;
    GeneMetrics {
        mean_counts: totals.iter().map(|t| t / n_obs_f).collect(),
        pct_dropout_by_counts: n_cells.iter().map(|&c| 100.0 * (1.0 - c as f64 / n_obs_f)).collect(),
        n_cells_by_counts: n_cells,
        total_counts: totals,
    }
}


/**
 * Annotate the matrix with QC metrics, in the manner of scanpy's calculate_qc_metrics
 * with qc_vars=["mt"]: var gets the mt flag and gene metrics, obs gets the cell metrics.
 * Existing annotations of the same names are replaced
 */
pub fn annotate_qc_metrics(mat: &mut CountMatrix, mt_prefix: &str) -> anyhow::Result<CellMetrics> {
    let flagged = flag_genes_with_prefix(&mat.var_names, mt_prefix);
    debug!("{} genes start with '{}'", flagged.iter().filter(|f| **f).count(), mt_prefix);

    let cell = compute_cell_metrics(&mat.x, &flagged);
    let gene = compute_gene_metrics(&mat.x);

    mat.set_var(QC_VAR_MT, ColumnData::Boolean(flagged))?;
    mat.set_var(VAR_N_CELLS_BY_COUNTS, ColumnData::Numeric(gene.n_cells_by_counts.iter().map(|&c| c as f64).collect()))?;
    mat.set_var(VAR_MEAN_COUNTS, ColumnData::Numeric(gene.mean_counts))?;
    mat.set_var(VAR_PCT_DROPOUT_BY_COUNTS, ColumnData::Numeric(gene.pct_dropout_by_counts))?;
    mat.set_var(VAR_TOTAL_COUNTS, ColumnData::Numeric(gene.total_counts))?;

    mat.set_obs(OBS_N_GENES_BY_COUNTS, ColumnData::Numeric(cell.n_genes_by_counts.iter().map(|&c| c as f64).collect()))?;
    mat.set_obs(OBS_TOTAL_COUNTS, ColumnData::Numeric(cell.total_counts.clone()))?;
    mat.set_obs(OBS_TOTAL_COUNTS_MT, ColumnData::Numeric(cell.total_counts_flagged.clone()))?;
    mat.set_obs(OBS_PCT_COUNTS_MT, ColumnData::Numeric(cell.pct_counts_flagged.clone()))?;

    Ok(cell)
}
