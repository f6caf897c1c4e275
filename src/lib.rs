//! Lab Stager Library
//!
//! Stages header-annotated instrument CSV files into a partitioned Parquet
//! dataset with a queryable manifest.
//!
//! This library provides tools for:
//! - Parsing `#`-prefixed procedure/parameter/metadata headers
//! - Typing header values by a declarative procedure schema or by sniffing
//! - Reading malformed data blocks through a four-level fallback chain
//! - Partitioning by day, procedure and acquisition computer
//! - Idempotent, atomic part-file writes on a bounded worker pool
//! - A sorted manifest and rejects report for every run

pub mod cli;
pub mod coercion;
pub mod config;
pub mod constants;
pub mod error;
pub mod header;
pub mod models;
pub mod partition;
pub mod processor;
pub mod schema;
pub mod table;

pub use config::StagerConfig;
pub use error::{Result, StagerError};
pub use models::{DiscoveryReport, FileOutcome, ManifestRow, StagingSummary};
pub use processor::StagingProcessor;
