use clap::Subcommand;

pub mod filter;
pub mod qc_metrics;
pub mod stats;

pub use filter::{CellClean, CellCleanParams, DoubletMethod, FilterCMD};
pub use qc_metrics::{QcMetrics, QcMetricsCMD};
pub use stats::{Stage, StageStats};

///////////////////////////////
/// Possible subcommands to parse
#[derive(Subcommand)]
pub enum Commands {
    /// QC filtering, doublet removal, merging and gene filtering of batches
    Filter(FilterCMD),
    /// Annotate QC metrics on a single file without filtering
    QcMetrics(QcMetricsCMD),
}



#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn show_presets_needs_no_files() {
        let cli = TestCli::try_parse_from(["cellclean", "filter", "--show-presets"]).unwrap();
        match cli.command {
            Commands::Filter(mut cmd) => {
                assert!(cmd.show_presets);
                assert!(cmd.path_out.is_none());
                cmd.try_execute().unwrap();
            }
            _ => panic!("expected the filter subcommand"),
        }
    }

    #[test]
    fn missing_output_is_an_error() {
        let cli = TestCli::try_parse_from(["cellclean", "filter", "-i", "a.h5ad,b.h5ad"]).unwrap();
        match cli.command {
            Commands::Filter(mut cmd) => {
                assert_eq!(cmd.path_in.len(), 2);
                let err = cmd.try_execute().unwrap_err();
                assert!(err.to_string().contains("Output file was not provided"));
            }
            _ => panic!("expected the filter subcommand"),
        }
    }
}
