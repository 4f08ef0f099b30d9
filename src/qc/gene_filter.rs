use log::info;
use sprs::CsMat;

use crate::fileformat::{ColumnData, CountMatrix};

pub const DEFAULT_MIN_CELL_FRACTION: f64 = 0.001;

pub const VAR_N_CELLS: &str = "n_cells";


#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneFilterParams {
    pub min_cell_fraction: f64,
}
impl Default for GeneFilterParams {
    fn default() -> Self {
        Self { min_cell_fraction: DEFAULT_MIN_CELL_FRACTION }
    }
}
impl GeneFilterParams {

    /**
     * Minimum number of cells a gene must be detected in, relative to the population.
     * Rounds half to even, as python's round() does
     */
    pub fn min_cells(&self, n_cells: usize) -> usize {
        let t = (self.min_cell_fraction * n_cells as f64).round_ties_even();
        if t <= 0.0 { 0 } else { t as usize }
    }
}


/// For each gene, the number of cells with a non-zero count
pub fn count_cells_per_gene(x: &CsMat<f64>) -> Vec<usize> {
    let mut n_cells = vec![0usize; x.cols()];
    for row in x.outer_iterator() {
        for (gene, &v) in row.iter() {
            if v != 0.0 {
                n_cells[gene] += 1;
            }
        }
    }
    n_cells
}


/**
 * Drop genes detected in fewer cells than the threshold. The threshold is taken
 * from the cell count of this matrix, so call it once on the merged population.
 * The detected-cell count of kept genes is annotated as var "n_cells"
 */
pub fn filter_genes(mut mat: CountMatrix, params: &GeneFilterParams) -> anyhow::Result<CountMatrix> {
    let min_cells = params.min_cells(mat.n_obs());
    let n_cells = count_cells_per_gene(&mat.x);
    let keep: Vec<bool> = n_cells.iter().map(|&n| n >= min_cells).collect();

    mat.set_var(VAR_N_CELLS, ColumnData::Numeric(n_cells.iter().map(|&n| n as f64).collect()))?;
    let filtered = mat.filter_vars(&keep)?;
    info!(
        "Gene filter kept {} of {} genes (detected in at least {} of {} cells)",
        filtered.n_vars(), mat.n_vars(), min_cells, mat.n_obs()
    );
    Ok(filtered)
}
