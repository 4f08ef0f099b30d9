pub mod anndata;
pub mod batch_files;
pub mod count_matrix;

pub use count_matrix::Annotations;
pub use count_matrix::ColumnData;
pub use count_matrix::CountMatrix;

pub use anndata::read_h5ad;
pub use anndata::write_h5ad;

pub use batch_files::batch_name;
pub use batch_files::resolve_batch_paths;
pub use batch_files::verify_input_h5ad_file;
