use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::bail;

pub const BATCH_PATTERN_PLACEHOLDER: &str = "{}";


/**
 * Figure out which files to load. Either an explicit list, or a pattern such as
 * "input_sce_Batch{}.h5ad" expanded for batch 1..=num_batches
 */
pub fn resolve_batch_paths(
    explicit: &[PathBuf],
    pattern: Option<&str>,
    num_batches: Option<usize>
) -> anyhow::Result<Vec<PathBuf>> {
    match (explicit.is_empty(), pattern) {
        (false, None) => Ok(explicit.to_vec()),
        (true, Some(pattern)) => {
            if !pattern.contains(BATCH_PATTERN_PLACEHOLDER) {
                bail!("Batch pattern '{}' must contain {} where the batch number goes", pattern, BATCH_PATTERN_PLACEHOLDER);
            }
            let Some(num_batches) = num_batches else {
                bail!("A batch pattern needs the number of batches");
            };
            Ok((1..=num_batches)
                .map(|i| PathBuf::from(pattern.replace(BATCH_PATTERN_PLACEHOLDER, &i.to_string())))
                .collect())
        }
        (false, Some(_)) => bail!("Give either input files or a batch pattern, not both"),
        (true, None) => bail!("No input files given"),
    }
}


/// Name of a batch, as recorded in the batch annotation: the file name without .h5ad
pub fn batch_name(p: &Path) -> String {
    let fname = p
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| p.display().to_string());
    match fname.strip_suffix(".h5ad") {
        Some(stem) => stem.to_string(),
        None => fname,
    }
}


/////// Check that the specified file looks like an anndata file we can open
pub fn verify_input_h5ad_file(path_in: &Path) -> anyhow::Result<()> {
    if !path_in.to_string_lossy().ends_with(".h5ad") {
        bail!("Input file {} must be an .h5ad file", path_in.display());
    }
    match File::open(path_in) {
        Ok(file) => {
            if file.metadata()?.len() == 0 {
                bail!("Input file {} is empty", path_in.display());
            }
            Ok(())
        }
        Err(e) => bail!("Cannot open input file {}: {}", path_in.display(), e),
    }
}
