pub mod cell_filter;
pub mod gene_filter;
pub mod metrics;

pub use cell_filter::filter_cells;
pub use cell_filter::QcThresholds;

pub use gene_filter::filter_genes;
pub use gene_filter::GeneFilterParams;

pub use metrics::annotate_qc_metrics;
pub use metrics::DEFAULT_MT_PREFIX;
