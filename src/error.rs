//! Error handling for staging operations.
//!
//! Per-file errors are recovered by the orchestrator and reported as failed
//! outcomes; only a missing input root aborts a run.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("Input root not found at path: {path}")]
    InputRootNotFound { path: PathBuf },

    #[error("Header unreadable for file: {path} - {reason}")]
    HeaderUnreadable { path: PathBuf, reason: String },

    #[error("No read strategy could parse the data block of: {path}")]
    TableUnparseable { path: PathBuf },

    #[error("No data rows in file: {path}")]
    NoData { path: PathBuf },

    #[error("Failed to write part file: {path} - {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("Invalid procedure schema file: {path} - {reason}")]
    SchemaConfig { path: PathBuf, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Manifest construction failed: {reason}")]
    ManifestFailed { reason: String },
}

pub type Result<T> = std::result::Result<T, StagerError>;
