//! Configuration management and validation.
//!
//! `StagerConfig` is the single explicit configuration passed into the
//! orchestrator at construction; nothing in the pipeline reads global state.

use crate::constants::{
    DEFAULT_DATASET, DEFAULT_EXCLUDED_DIRS, DEFAULT_FILE_PATTERNS, DEFAULT_MANIFEST_FIELDS,
    MAX_DEFAULT_WORKERS,
};
use crate::error::{Result, StagerError};
use polars::prelude::ParquetCompression;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Supported compression algorithms for part files and the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    /// Snappy compression - good balance of speed and compression
    #[default]
    Snappy,
    /// ZSTD compression - better compression ratio, slower
    Zstd,
    /// LZ4 compression - fastest, lower compression ratio
    Lz4,
    /// No compression
    Uncompressed,
}

impl CompressionAlgorithm {
    /// Convert to polars ParquetCompression type
    pub fn to_polars_compression(&self) -> ParquetCompression {
        match self {
            CompressionAlgorithm::Snappy => ParquetCompression::Snappy,
            CompressionAlgorithm::Zstd => ParquetCompression::Zstd(None),
            CompressionAlgorithm::Lz4 => ParquetCompression::Lz4Raw,
            CompressionAlgorithm::Uncompressed => ParquetCompression::Uncompressed,
        }
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = StagerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "snappy" => Ok(CompressionAlgorithm::Snappy),
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            "none" | "uncompressed" => Ok(CompressionAlgorithm::Uncompressed),
            other => Err(StagerError::Configuration {
                message: format!(
                    "Unknown compression '{}' (expected snappy, zstd, lz4 or none)",
                    other
                ),
            }),
        }
    }
}

/// System profiling information used to size the worker pool
#[derive(Debug, Clone)]
pub struct SystemProfile {
    /// Number of logical CPU cores available
    pub cpu_cores: usize,
    /// Physical cores
    pub performance_cores: usize,
}

impl SystemProfile {
    /// Auto-detect system capabilities
    pub fn detect() -> Self {
        Self {
            cpu_cores: num_cpus::get(),
            performance_cores: num_cpus::get_physical(),
        }
    }

    /// Default worker count: one per core, capped since the work is I/O bound
    pub fn default_workers(&self) -> usize {
        self.cpu_cores.clamp(1, MAX_DEFAULT_WORKERS)
    }
}

/// Global configuration for a staging run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagerConfig {
    /// Root of the raw instrument file tree
    pub input_root: PathBuf,

    /// Root under which the dataset and manifest are written
    pub output_root: PathBuf,

    /// Dataset directory name below the output root
    pub dataset: String,

    /// Rewrite part files that already exist
    pub overwrite: bool,

    /// Number of files processed concurrently
    pub workers: usize,

    /// Optional YAML procedure schema
    pub schema_path: Option<PathBuf>,

    /// Cast declared data columns to their schema types
    pub pin_schema: bool,

    /// File name glob patterns eligible for staging (case-insensitive)
    pub file_patterns: Vec<String>,

    /// Directory names never descended into
    pub excluded_dirs: Vec<String>,

    /// Metadata keys denormalised into the manifest
    pub manifest_fields: Vec<String>,

    /// Drop data columns in which every value is null
    pub drop_empty_columns: bool,

    /// Strip units and map column synonyms to canonical names
    pub normalize_columns: bool,

    /// Part file compression
    pub compression: CompressionAlgorithm,

    /// Discovery only mode (parse headers and exit without writing)
    pub dry_run: bool,

    /// Draw a progress bar while staging
    pub show_progress: bool,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("."),
            output_root: PathBuf::from("staged"),
            dataset: DEFAULT_DATASET.to_string(),
            overwrite: false,
            workers: SystemProfile::detect().default_workers(),
            schema_path: None,
            pin_schema: false,
            file_patterns: DEFAULT_FILE_PATTERNS.iter().map(|p| p.to_string()).collect(),
            excluded_dirs: DEFAULT_EXCLUDED_DIRS.iter().map(|d| d.to_string()).collect(),
            manifest_fields: DEFAULT_MANIFEST_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            drop_empty_columns: true,
            normalize_columns: true,
            compression: CompressionAlgorithm::default(),
            dry_run: false,
            show_progress: true,
        }
    }
}

impl StagerConfig {
    /// Configuration for the given input and output roots
    pub fn new(input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
            ..Self::default()
        }
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Set worker count (at least 1)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_schema_path(mut self, schema_path: Option<PathBuf>) -> Self {
        self.schema_path = schema_path;
        self
    }

    pub fn with_pin_schema(mut self, pin_schema: bool) -> Self {
        self.pin_schema = pin_schema;
        self
    }

    pub fn with_file_patterns(mut self, patterns: Vec<String>) -> Self {
        self.file_patterns = patterns;
        self
    }

    pub fn with_excluded_dirs(mut self, dirs: Vec<String>) -> Self {
        self.excluded_dirs = dirs;
        self
    }

    pub fn with_manifest_fields(mut self, fields: Vec<String>) -> Self {
        self.manifest_fields = fields;
        self
    }

    pub fn with_drop_empty_columns(mut self, drop: bool) -> Self {
        self.drop_empty_columns = drop;
        self
    }

    pub fn with_normalize_columns(mut self, normalize: bool) -> Self {
        self.normalize_columns = normalize;
        self
    }

    pub fn with_compression(mut self, compression: CompressionAlgorithm) -> Self {
        self.compression = compression;
        self
    }

    /// Enable discovery only mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Directory holding the partitioned dataset
    pub fn dataset_path(&self) -> PathBuf {
        self.output_root.join(&self.dataset)
    }

    /// Check settings that would otherwise fail late
    pub fn validate(&self) -> Result<()> {
        if self.dataset.trim().is_empty()
            || self.dataset.contains(['/', '\\'])
            || self.dataset == "."
            || self.dataset == ".."
        {
            return Err(StagerError::Configuration {
                message: format!("Invalid dataset name '{}'", self.dataset),
            });
        }

        if self.workers == 0 {
            return Err(StagerError::Configuration {
                message: "Worker count must be at least 1".to_string(),
            });
        }

        if self.file_patterns.is_empty() {
            return Err(StagerError::Configuration {
                message: "At least one file pattern is required".to_string(),
            });
        }

        for pattern in &self.file_patterns {
            glob::Pattern::new(pattern).map_err(|e| StagerError::Configuration {
                message: format!("Invalid file pattern '{}': {}", pattern, e),
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StagerConfig::default();
        assert_eq!(config.dataset, "raw_measurements");
        assert!(!config.overwrite);
        assert!(config.workers >= 1 && config.workers <= MAX_DEFAULT_WORKERS);
        assert_eq!(config.file_patterns, vec!["*.csv".to_string()]);
        assert!(config.excluded_dirs.contains(&".git".to_string()));
        assert!(config.drop_empty_columns);
        assert!(config.normalize_columns);
        assert_eq!(config.compression, CompressionAlgorithm::Snappy);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = StagerConfig::new("/data/raw", "/data/staged")
            .with_dataset("sweeps")
            .with_overwrite(true)
            .with_workers(0)
            .with_pin_schema(true)
            .with_dry_run(true);

        assert_eq!(config.workers, 1);
        assert!(config.overwrite);
        assert!(config.pin_schema);
        assert!(config.dry_run);
        assert_eq!(config.dataset_path(), PathBuf::from("/data/staged/sweeps"));
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let bad_dataset = StagerConfig::default().with_dataset("a/b");
        assert!(matches!(
            bad_dataset.validate(),
            Err(StagerError::Configuration { .. })
        ));

        let bad_pattern = StagerConfig::default().with_file_patterns(vec!["[".to_string()]);
        assert!(bad_pattern.validate().is_err());

        let no_patterns = StagerConfig::default().with_file_patterns(vec![]);
        assert!(no_patterns.validate().is_err());
    }

    #[test]
    fn test_compression_parsing() {
        assert_eq!(
            "ZSTD".parse::<CompressionAlgorithm>().unwrap(),
            CompressionAlgorithm::Zstd
        );
        assert_eq!(
            "none".parse::<CompressionAlgorithm>().unwrap(),
            CompressionAlgorithm::Uncompressed
        );
        assert!("brotli".parse::<CompressionAlgorithm>().is_err());
    }

    #[test]
    fn test_system_profile_detection() {
        let profile = SystemProfile::detect();
        assert!(profile.cpu_cores >= 1);
        assert!(profile.default_workers() <= MAX_DEFAULT_WORKERS);
    }
}
