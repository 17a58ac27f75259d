use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "aq-fusion")]
#[command(about = "Air-quality source fusion and PM2.5 forecasting")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file [default: aq-fusion.toml]")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Log file path")]
    pub log_file: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Hide progress bars")]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IngestSource {
    Ground,
    Weather,
    Grid,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportKind {
    Measurements,
    Predictions,
}

impl ExportKind {
    pub fn dataset_name(&self) -> &'static str {
        match self {
            ExportKind::Measurements => "measurements",
            ExportKind::Predictions => "predictions",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover ground stations in the target cities and register new ones
    SyncStations,

    /// Run one ingestion pass
    Ingest {
        #[arg(short, long, value_enum, default_value_t = IngestSource::All)]
        source: IngestSource,

        #[arg(long, help = "Override the configured worker limit")]
        max_workers: Option<usize>,
    },

    /// Collapse duplicate measurement rows and enforce the unique key
    Dedup,

    /// Train on recent rows and replace all predictions
    Forecast,

    /// Latest row per station with likely source and health advice
    Status {
        #[arg(short = 'i', long)]
        station_id: Option<String>,
    },

    /// Export measurements or predictions to Parquet
    Export {
        #[arg(short, long, value_enum)]
        what: ExportKind,

        #[arg(
            short,
            long,
            help = "Output Parquet file path [default: output/aq-{what}-{YYMMDD}.parquet]"
        )]
        output: Option<PathBuf>,

        #[arg(short, long, default_value = "snappy")]
        compression: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_ingest_and_export() {
        let cli = Cli::parse_from(["aq-fusion", "--config", "prod.toml", "ingest", "--source", "grid"]);
        assert_eq!(cli.config, Some(PathBuf::from("prod.toml")));
        assert!(matches!(
            cli.command,
            Commands::Ingest {
                source: IngestSource::Grid,
                max_workers: None
            }
        ));

        let cli = Cli::parse_from(["aq-fusion", "export", "-w", "predictions", "-c", "zstd", "-q"]);
        assert!(cli.quiet);
        match cli.command {
            Commands::Export {
                what,
                output,
                compression,
            } => {
                assert_eq!(what, ExportKind::Predictions);
                assert!(output.is_none());
                assert_eq!(compression, "zstd");
            }
            _ => panic!("expected export"),
        }
    }
}
