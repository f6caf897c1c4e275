//! Command-line interface components.

use crate::config::{CompressionAlgorithm, StagerConfig};
use crate::error::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "lab-stager")]
#[command(about = "Stage header-annotated instrument CSV files into a partitioned Parquet dataset")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Root directory of the raw instrument file tree
    #[arg(value_name = "INPUT_ROOT")]
    pub input_root: PathBuf,

    /// Output root for the dataset and its manifest
    #[arg(short, long, value_name = "OUTPUT_ROOT")]
    pub output: PathBuf,

    /// Dataset directory name below the output root
    #[arg(long, default_value = crate::constants::DEFAULT_DATASET)]
    pub dataset: String,

    /// Rewrite part files that already exist
    #[arg(long)]
    pub overwrite: bool,

    /// Number of files processed concurrently (default: CPU cores, at most 8)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// YAML procedure schema used to type header fields and data columns
    #[arg(long, value_name = "YAML")]
    pub schema: Option<PathBuf>,

    /// Cast declared data columns to their schema types
    #[arg(long, requires = "schema")]
    pub pin_schema: bool,

    /// File name glob pattern to stage (repeatable)
    #[arg(long = "pattern", value_name = "GLOB")]
    pub patterns: Vec<String>,

    /// Keep data columns in which every value is null
    #[arg(long)]
    pub keep_empty_columns: bool,

    /// Part file compression algorithm (snappy, zstd, lz4, none)
    #[arg(long, default_value = "snappy")]
    pub compression: String,

    /// Discovery mode: parse headers and report, without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn log_level(&self) -> Level {
        if self.verbose { Level::DEBUG } else { Level::INFO }
    }

    /// Build the run configuration from the parsed arguments
    pub fn to_config(&self) -> Result<StagerConfig> {
        let compression: CompressionAlgorithm = self.compression.parse()?;

        let mut config = StagerConfig::new(&self.input_root, &self.output)
            .with_dataset(self.dataset.clone())
            .with_overwrite(self.overwrite)
            .with_schema_path(self.schema.clone())
            .with_pin_schema(self.pin_schema)
            .with_drop_empty_columns(!self.keep_empty_columns)
            .with_compression(compression)
            .with_dry_run(self.dry_run)
            .with_progress(!self.no_progress);

        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        if !self.patterns.is_empty() {
            config = config.with_file_patterns(self.patterns.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StagerError;

    #[test]
    fn test_minimal_arguments() {
        let args = Args::parse_from(["lab-stager", "/data/raw", "-o", "/data/staged"]);
        let config = args.to_config().unwrap();

        assert_eq!(config.input_root, PathBuf::from("/data/raw"));
        assert_eq!(config.output_root, PathBuf::from("/data/staged"));
        assert_eq!(config.dataset, "raw_measurements");
        assert!(!config.overwrite);
        assert!(config.drop_empty_columns);
        assert!(config.show_progress);
        assert_eq!(args.log_level(), Level::INFO);
    }

    #[test]
    fn test_all_flags() {
        let args = Args::parse_from([
            "lab-stager",
            "/data/raw",
            "--output",
            "/data/staged",
            "--dataset",
            "sweeps",
            "--overwrite",
            "--workers",
            "3",
            "--schema",
            "procedures.yml",
            "--pin-schema",
            "--pattern",
            "*.csv",
            "--pattern",
            "*.txt",
            "--keep-empty-columns",
            "--compression",
            "zstd",
            "--dry-run",
            "--no-progress",
            "-v",
        ]);
        let config = args.to_config().unwrap();

        assert_eq!(config.dataset, "sweeps");
        assert!(config.overwrite);
        assert_eq!(config.workers, 3);
        assert_eq!(config.schema_path, Some(PathBuf::from("procedures.yml")));
        assert!(config.pin_schema);
        assert_eq!(config.file_patterns, vec!["*.csv", "*.txt"]);
        assert!(!config.drop_empty_columns);
        assert_eq!(config.compression, CompressionAlgorithm::Zstd);
        assert!(config.dry_run);
        assert!(!config.show_progress);
        assert_eq!(args.log_level(), Level::DEBUG);
    }

    #[test]
    fn test_pin_schema_requires_schema() {
        let result = Args::try_parse_from(["lab-stager", "/raw", "-o", "/out", "--pin-schema"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_compression_is_rejected() {
        let args = Args::parse_from(["lab-stager", "/raw", "-o", "/out", "--compression", "lzma"]);
        assert!(matches!(
            args.to_config(),
            Err(StagerError::Configuration { .. })
        ));
    }
}
