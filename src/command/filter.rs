use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use log::{info, warn};

use super::stats::{Stage, StageStats};
use crate::doublet::presets::{get_preset_script_names, DEFAULT_PRESET};
use crate::doublet::{remove_doublets, DoubletDetector, ScriptDoubletDetector};
use crate::fileformat::{batch_name, read_h5ad, resolve_batch_paths, verify_input_h5ad_file, write_h5ad, CountMatrix};
use crate::merge::{concat, DEFAULT_BATCH_KEY};
use crate::qc::cell_filter::{DEFAULT_MAX_PCT_MT, DEFAULT_MAX_TOTAL_COUNTS, DEFAULT_MIN_GENES};
use crate::qc::gene_filter::DEFAULT_MIN_CELL_FRACTION;
use crate::qc::{filter_cells, filter_genes, GeneFilterParams, QcThresholds, DEFAULT_MT_PREFIX};

pub const DEFAULT_PATH_TEMP: &str = "temp";
pub const DEFAULT_PHENOTYPE_KEY: &str = "Phenotype";
pub const DEFAULT_EXCLUDE_PHENOTYPE: &str = "BD";

/// Batch name used in statistics for the merged population
pub const MERGED_BATCH_NAME: &str = "merged";


#[derive(Args)]
pub struct FilterCMD {
    // Input h5ad files, one per batch
    #[arg(short = 'i', value_parser = clap::value_parser!(PathBuf), num_args = 1.., value_delimiter = ',')]
    pub path_in: Vec<PathBuf>,

    // Input file name pattern, {} is replaced by 1..=num_batches
    #[arg(long = "batch-pattern", requires = "num_batches")]
    pub batch_pattern: Option<String>,

    #[arg(long = "num-batches", value_parser = clap::value_parser!(usize))]
    pub num_batches: Option<usize>,

    // Output h5ad with all cleaned cells
    #[arg(short = 'o', value_parser = clap::value_parser!(PathBuf))]
    pub path_out: Option<PathBuf>,

    // Optional output h5ad without control cells
    #[arg(long = "out-subset", value_parser = clap::value_parser!(PathBuf))]
    pub path_out_subset: Option<PathBuf>,

    #[arg(long = "phenotype-key", default_value = DEFAULT_PHENOTYPE_KEY)]
    pub phenotype_key: String,

    // Phenotype label left out of the subset
    #[arg(long = "exclude-phenotype", default_value = DEFAULT_EXCLUDE_PHENOTYPE)]
    pub exclude_phenotype: String,

    // Cell annotation splitting each batch into units for doublet detection
    #[arg(long = "group-by")]
    pub group_by: Option<String>,

    #[arg(long = "mt-prefix", default_value = DEFAULT_MT_PREFIX)]
    pub mt_prefix: String,

    #[arg(long = "min-genes", value_parser = clap::value_parser!(usize), default_value_t = DEFAULT_MIN_GENES)]
    pub min_genes: usize,

    #[arg(long = "max-pct-mt", value_parser = clap::value_parser!(f64), default_value_t = DEFAULT_MAX_PCT_MT)]
    pub max_pct_mt: f64,

    #[arg(long = "max-total-counts", value_parser = clap::value_parser!(f64), default_value_t = DEFAULT_MAX_TOTAL_COUNTS)]
    pub max_total_counts: f64,

    #[arg(long = "min-cell-fraction", value_parser = clap::value_parser!(f64), default_value_t = DEFAULT_MIN_CELL_FRACTION)]
    pub min_cell_fraction: f64,

    // Cell annotation recording the source batch. Empty to disable
    #[arg(long = "batch-key", default_value = DEFAULT_BATCH_KEY)]
    pub batch_key: String,

    // User provided doublet detection script
    #[arg(long = "doublet-script", value_parser = clap::value_parser!(PathBuf), conflicts_with = "doublet_preset")]
    pub doublet_script: Option<PathBuf>,

    // Embedded doublet detection script
    #[arg(long = "doublet-preset", default_value = DEFAULT_PRESET)]
    pub doublet_preset: String,

    //Show a list of preset scripts available
    #[arg(long = "show-presets")]
    pub show_presets: bool,

    #[arg(long = "skip-doublets")]
    pub skip_doublets: bool,

    // Temp file directory
    #[arg(short = 't', value_parser = clap::value_parser!(PathBuf), default_value = DEFAULT_PATH_TEMP)]
    pub path_tmp: PathBuf,

    // Cell counts per stage, as TSV
    #[arg(long = "stats", value_parser = clap::value_parser!(PathBuf))]
    pub path_stats: Option<PathBuf>,
}
impl FilterCMD {
    pub fn try_execute(&mut self) -> Result<()> {

        if self.show_presets {
            println!("Available preset scripts: {:?}", get_preset_script_names());
            return Ok(());
        }

        let Some(path_out) = self.path_out.clone() else {
            bail!("Output file was not provided");
        };

        let path_in = resolve_batch_paths(&self.path_in, self.batch_pattern.as_deref(), self.num_batches)?;

        let doublets = if self.skip_doublets {
            DoubletMethod::Skip
        } else if let Some(p) = &self.doublet_script {
            DoubletMethod::Script(p.clone())
        } else {
            DoubletMethod::Preset(self.doublet_preset.clone())
        };

        let params = CellCleanParams {
            path_in,
            path_out,
            path_out_subset: self.path_out_subset.clone(),
            path_tmp: self.path_tmp.clone(),
            path_stats: self.path_stats.clone(),
            phenotype_key: self.phenotype_key.clone(),
            exclude_phenotype: self.exclude_phenotype.clone(),
            group_by: self.group_by.clone(),
            mt_prefix: self.mt_prefix.clone(),
            qc: QcThresholds {
                min_genes: self.min_genes,
                max_pct_mt: self.max_pct_mt,
                max_total_counts: self.max_total_counts,
            },
            genes: GeneFilterParams {
                min_cell_fraction: self.min_cell_fraction,
            },
            batch_key: if self.batch_key.is_empty() { None } else { Some(self.batch_key.clone()) },
            doublets,
        };

        CellClean::run(&params)?;

        log::info!("Filter has finished succesfully");
        Ok(())
    }
}



/// How doublets are detected
#[derive(Debug, Clone, PartialEq)]
pub enum DoubletMethod {
    Skip,
    Preset(String),
    Script(PathBuf),
}


#[derive(Debug, Clone)]
pub struct CellCleanParams {
    pub path_in: Vec<PathBuf>,
    pub path_out: PathBuf,
    pub path_out_subset: Option<PathBuf>,
    pub path_tmp: PathBuf,
    pub path_stats: Option<PathBuf>,

    pub phenotype_key: String,
    pub exclude_phenotype: String,
    pub group_by: Option<String>,
    pub mt_prefix: String,

    pub qc: QcThresholds,
    pub genes: GeneFilterParams,
    pub batch_key: Option<String>,
    pub doublets: DoubletMethod,
}


pub struct CellClean {}
impl CellClean {

    /**
     * Full run from files to files. The temp directory is only created when an
     * external doublet script is used
     */
    pub fn run(params: &CellCleanParams) -> anyhow::Result<()> {
        if params.path_in.is_empty() {
            bail!("No input files given");
        }
        for p in &params.path_in {
            verify_input_h5ad_file(p)?;
        }

        if params.doublets == DoubletMethod::Skip {
            warn!("Doublet detection is disabled");
            return Self::run_with_detector(params, None).map(|_| ());
        }

        if params.path_tmp.exists() {
            bail!("Temporary directory '{}' exists already. For safety reasons, this is not allowed. Specify as a subdirectory of an existing directory", params.path_tmp.display());
        }
        info!("Using tempdir {}", params.path_tmp.display());
        fs::create_dir_all(&params.path_tmp)
            .with_context(|| format!("Failed to create temporary directory {}", params.path_tmp.display()))?;

        let result = (|| {
            let detector = match &params.doublets {
                DoubletMethod::Script(p) => ScriptDoubletDetector::new_from_file(p, &params.path_tmp)?,
                DoubletMethod::Preset(name) => ScriptDoubletDetector::new_from_preset(name, &params.path_tmp)?,
                DoubletMethod::Skip => bail!("No doublet detection method"),
            };
            Self::run_with_detector(params, Some(&detector as &dyn DoubletDetector))
        })();

        let _ = fs::remove_dir_all(&params.path_tmp);
        result.map(|_| ())
    }


    /**
     * Load the batches one at a time, clean them, then merge and write.
     * Returns the statistics that were collected
     */
    pub fn run_with_detector(
        params: &CellCleanParams,
        detector: Option<&dyn DoubletDetector>
    ) -> anyhow::Result<StageStats> {
        let mut stats = StageStats::new(&params.phenotype_key, &params.exclude_phenotype);

        let mut parts: Vec<(String, CountMatrix)> = Vec::new();
        for (i, p) in params.path_in.iter().enumerate() {
            let name = batch_name(p);
            info!("Processing batch {} of {}: {}", i + 1, params.path_in.len(), p.display());
            let mat = read_h5ad(p).with_context(|| format!("Failed to load batch {}", p.display()))?;
            for unit in Self::process_batch(&name, mat, params, detector, &mut stats)? {
                parts.push((name.clone(), unit));
            }
        }

        let cleaned = Self::finish(parts, params, &mut stats)?;

        write_h5ad(&cleaned, &params.path_out)?;
        info!("Wrote {} cells x {} genes to {}", cleaned.n_obs(), cleaned.n_vars(), params.path_out.display());

        if let Some(path_subset) = &params.path_out_subset {
            let subset = Self::phenotype_subset(&cleaned, &params.phenotype_key, &params.exclude_phenotype)?;
            write_h5ad(&subset, path_subset)?;
            info!(
                "Wrote {} cells without {}={} to {}",
                subset.n_obs(), params.phenotype_key, params.exclude_phenotype, path_subset.display()
            );
        }

        if let Some(path_stats) = &params.path_stats {
            stats.write_tsv(path_stats)?;
        }
        Ok(stats)
    }


    /**
     * QC and doublet filtering of one batch. Returns one matrix per doublet
     * detection unit, possibly none if all cells were removed
     */
    pub fn process_batch(
        name: &str,
        mat: CountMatrix,
        params: &CellCleanParams,
        detector: Option<&dyn DoubletDetector>,
        stats: &mut StageStats
    ) -> anyhow::Result<Vec<CountMatrix>> {
        stats.record(name, Stage::Loaded, &mat);
        info!("Batch {}: {} cells x {} genes", name, mat.n_obs(), mat.n_vars());

        if params.path_out_subset.is_some() && !mat.obs.contains(&params.phenotype_key) {
            bail!("Batch {} has no cell annotation '{}' to select the subset by", name, params.phenotype_key);
        }

        let qc_passed = filter_cells(mat, &params.qc, &params.mt_prefix)
            .with_context(|| format!("QC failed for batch {}", name))?;
        stats.record(name, Stage::QcFiltered, &qc_passed);

        let units = match detector {
            Some(detector) => remove_doublets(&qc_passed, detector, params.group_by.as_deref())
                .with_context(|| format!("Doublet detection failed for batch {}", name))?,
            None => vec![qc_passed],
        };

        let num_cells = units.iter().map(|u| u.n_obs()).sum();
        let num_excl = units
            .iter()
            .map(|u| stats.count_excluding_control(u))
            .try_fold(0, |acc, n| n.map(|n| acc + n));
        let num_genes = units.first().map(|u| u.n_vars()).unwrap_or(0);
        stats.record_parts(name, Stage::DoubletFiltered, num_cells, num_genes, num_excl);
        info!("Batch {}: {} cells left after QC and doublet removal", name, num_cells);

        Ok(units)
    }


    /// Merge all parts and remove rare genes
    pub fn finish(
        parts: Vec<(String, CountMatrix)>,
        params: &CellCleanParams,
        stats: &mut StageStats
    ) -> anyhow::Result<CountMatrix> {
        if parts.is_empty() {
            bail!("No cells passed filtering in any batch");
        }

        let merged = concat(parts, params.batch_key.as_deref())?;
        stats.record(MERGED_BATCH_NAME, Stage::Merged, &merged);
        if merged.n_obs() == 0 {
            bail!("No cells passed filtering in any batch");
        }
        if params.path_out_subset.is_some() && !merged.obs.contains(&params.phenotype_key) {
            bail!(
                "Cell annotation '{}' did not survive merging, so the subset cannot be made. Is it stored with the same type in all batches?",
                params.phenotype_key
            );
        }

        let cleaned = filter_genes(merged, &params.genes)?;
        stats.record(MERGED_BATCH_NAME, Stage::GeneFiltered, &cleaned);
        Ok(cleaned)
    }


    /// All cells whose phenotype differs from the control label
    pub fn phenotype_subset(
        mat: &CountMatrix,
        phenotype_key: &str,
        exclude: &str
    ) -> anyhow::Result<CountMatrix> {
        let labels = mat.obs_labels(phenotype_key)?;
        let keep: Vec<bool> = labels.iter().map(|l| l != exclude).collect();
        mat.filter_obs(&keep)
    }
}
