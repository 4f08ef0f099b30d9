use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use log::info;

use crate::fileformat::{read_h5ad, verify_input_h5ad_file, write_h5ad};
use crate::qc::{annotate_qc_metrics, DEFAULT_MT_PREFIX};


#[derive(Args)]
pub struct QcMetricsCMD {
    // Input h5ad
    #[arg(short = 'i', value_parser = clap::value_parser!(PathBuf))]
    pub path_in: PathBuf,

    // Output h5ad, with metrics added as cell and gene annotations
    #[arg(short = 'o', value_parser = clap::value_parser!(PathBuf))]
    pub path_out: PathBuf,

    #[arg(long = "mt-prefix", default_value = DEFAULT_MT_PREFIX)]
    pub mt_prefix: String,
}
impl QcMetricsCMD {
    pub fn try_execute(&mut self) -> Result<()> {
        QcMetrics::run(&QcMetrics {
            path_in: self.path_in.clone(),
            path_out: self.path_out.clone(),
            mt_prefix: self.mt_prefix.clone(),
        })?;

        log::info!("QcMetrics has finished succesfully");
        Ok(())
    }
}



/**
 * Annotate QC metrics without removing anything. Useful to look at the
 * distributions before picking thresholds
 */
pub struct QcMetrics {
    pub path_in: PathBuf,
    pub path_out: PathBuf,
    pub mt_prefix: String,
}
impl QcMetrics {
    pub fn run(params: &QcMetrics) -> anyhow::Result<()> {
        verify_input_h5ad_file(&params.path_in)?;
        let mut mat = read_h5ad(&params.path_in)
            .with_context(|| format!("Failed to load {}", params.path_in.display()))?;

        let metrics = annotate_qc_metrics(&mut mat, &params.mt_prefix)?;
        let num_flagged = mat
            .var_names
            .iter()
            .filter(|n| n.starts_with(params.mt_prefix.as_str()))
            .count();
        info!(
            "{} cells, {} genes of which {} start with {}; median genes per cell {}",
            mat.n_obs(),
            mat.n_vars(),
            num_flagged,
            params.mt_prefix,
            median(&metrics.n_genes_by_counts).unwrap_or(0)
        );

        write_h5ad(&mat, &params.path_out)?;
        Ok(())
    }
}


fn median(v: &[usize]) -> Option<usize> {
    if v.is_empty() {
        return None;
    }
    let mut sorted = v.to_vec();
    sorted.sort_unstable();
    Some(sorted[sorted.len() / 2])
}
