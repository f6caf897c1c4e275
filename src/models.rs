//! Core data structures shared across the staging pipeline.
//!
//! Defines the parsed header record, typed metadata values, partition keys,
//! per-file outcomes and run-level statistics.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use polars::prelude::{DataType, TimeUnit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::schema::FieldType;
use crate::table::ReadStrategy;

/// Logical header section a key/value line was attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderSection {
    Parameters,
    Metadata,
}

impl HeaderSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderSection::Parameters => "Parameters",
            HeaderSection::Metadata => "Metadata",
        }
    }
}

/// Structured view of a raw file's comment header
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedHeader {
    /// Fully qualified procedure name as declared, if any
    pub procedure: Option<String>,
    /// Short procedure code (declared suffix or inferred from the filename)
    pub proc_short: String,
    pub parameters: IndexMap<String, String>,
    pub metadata: IndexMap<String, String>,
    /// Raw value of the start-time line, captured independently of sections
    pub start_time_raw: Option<String>,
    /// Lines consumed up to and including the data marker
    pub header_lines: usize,
    /// Header lines before the data marker that lack the comment prefix
    pub unprefixed_lines: usize,
    pub data_marker_found: bool,
}

impl ParsedHeader {
    /// Iterate over every raw key/value pair with the section it belongs to
    pub fn entries(&self) -> impl Iterator<Item = (HeaderSection, &str, &str)> {
        self.parameters
            .iter()
            .map(|(k, v)| (HeaderSection::Parameters, k.as_str(), v.as_str()))
            .chain(
                self.metadata
                    .iter()
                    .map(|(k, v)| (HeaderSection::Metadata, k.as_str(), v.as_str())),
            )
    }

    pub fn is_empty(&self) -> bool {
        self.procedure.is_none()
            && self.parameters.is_empty()
            && self.metadata.is_empty()
            && self.start_time_raw.is_none()
            && self.header_lines == 0
    }
}

/// A header value after type coercion
#[derive(Debug, Clone, PartialEq)]
pub enum CoercedValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Text(String),
    Null,
}

impl CoercedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CoercedValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CoercedValue::Int(v) => Some(*v as f64),
            CoercedValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Polars dtype a constant column holding this value would take
    pub fn natural_dtype(&self) -> DataType {
        match self {
            CoercedValue::Int(_) => DataType::Int64,
            CoercedValue::Float(_) => DataType::Float64,
            CoercedValue::Bool(_) => DataType::Boolean,
            CoercedValue::Timestamp(_) => DataType::Datetime(TimeUnit::Microseconds, None),
            CoercedValue::Text(_) | CoercedValue::Null => DataType::String,
        }
    }
}

impl fmt::Display for CoercedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoercedValue::Int(v) => write!(f, "{v}"),
            CoercedValue::Float(v) => write!(f, "{v}"),
            CoercedValue::Bool(v) => write!(f, "{v}"),
            CoercedValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            CoercedValue::Text(v) => f.write_str(v),
            CoercedValue::Null => f.write_str("null"),
        }
    }
}

/// One coerced header field
#[derive(Debug, Clone, PartialEq)]
pub struct CoercedEntry {
    pub value: CoercedValue,
    pub section: HeaderSection,
    /// Type declared by the procedure schema, if one exists
    pub declared: Option<FieldType>,
}

impl CoercedEntry {
    /// Dtype for the broadcast column: declared type first, then the value's own
    pub fn dtype(&self) -> DataType {
        match self.declared {
            Some(field_type) => field_type.dtype(),
            None => self.value.natural_dtype(),
        }
    }
}

/// Header values after coercion, keyed by their original names
pub type CoercedMetadata = IndexMap<String, CoercedEntry>;

/// Where the resolved start time came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartTimeSource {
    Schema,
    Header,
    FileModified,
}

impl StartTimeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartTimeSource::Schema => "schema",
            StartTimeSource::Header => "header",
            StartTimeSource::FileModified => "mtime",
        }
    }

    /// True when the timestamp was read from the file's own header
    pub fn is_parsed(&self) -> bool {
        !matches!(self, StartTimeSource::FileModified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedStartTime {
    pub value: DateTime<Utc>,
    pub source: StartTimeSource,
}

/// Partition coordinates of one raw file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKey {
    pub day_id: String,
    pub proc: String,
    pub computer: String,
    pub experiment_id: String,
    /// Source path relative to the ingestion root, `/`-separated
    pub rel_path: String,
    pub file_name: String,
}

impl PartitionKey {
    /// Relative directory `day_id=<D>/proc=<P>/computer=<C>`
    pub fn partition_dir(&self) -> PathBuf {
        use crate::constants::partition_keys::{COMPUTER, DAY, PROC};
        PathBuf::from(format!("{DAY}={}", self.day_id))
            .join(format!("{PROC}={}", self.proc))
            .join(format!("{COMPUTER}={}", self.computer))
    }

    pub fn part_file_name(&self) -> String {
        format!(
            "part-{}.{}",
            self.experiment_id,
            crate::constants::PART_FILE_EXTENSION
        )
    }
}

/// Summary of one staged file, one row of the manifest
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestRow {
    pub experiment_id: String,
    pub proc: String,
    pub procedure: Option<String>,
    pub day_id: String,
    pub computer: String,
    pub rows: usize,
    pub rel_path: String,
    pub file_name: String,
    pub part_path: PathBuf,
    pub start_time: Option<DateTime<Utc>>,
    pub start_time_source: Option<StartTimeSource>,
    pub read_strategy: Option<ReadStrategy>,
    /// Selected metadata fields denormalised for indexing
    pub fields: BTreeMap<String, CoercedValue>,
}

/// Terminal state of one file in a run
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Written(ManifestRow),
    Kept(ManifestRow),
    Failed {
        path: PathBuf,
        rel_path: String,
        reason: String,
    },
}

impl FileOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            FileOutcome::Written(_) => "written",
            FileOutcome::Kept(_) => "kept",
            FileOutcome::Failed { .. } => "failed",
        }
    }

    pub fn manifest_row(&self) -> Option<&ManifestRow> {
        match self {
            FileOutcome::Written(row) | FileOutcome::Kept(row) => Some(row),
            FileOutcome::Failed { .. } => None,
        }
    }
}

/// Failed file entry in the rejects report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedFile {
    pub path: PathBuf,
    pub rel_path: String,
    pub reason: String,
}

/// Overall result of a staging run
#[derive(Debug, Default)]
pub struct StagingSummary {
    pub files_discovered: usize,
    pub files_written: usize,
    pub files_kept: usize,
    pub files_failed: usize,
    pub total_rows: usize,
    pub dataset_path: PathBuf,
    pub manifest_path: Option<PathBuf>,
    pub rejects_path: Option<PathBuf>,
    pub elapsed: Duration,
}

impl StagingSummary {
    pub fn files_succeeded(&self) -> usize {
        self.files_written + self.files_kept
    }

    pub fn files_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.files_discovered as f64 / secs
        } else {
            0.0
        }
    }

    /// Process exit code: failure only when there was work and none of it succeeded
    pub fn exit_code(&self) -> i32 {
        if self.files_discovered > 0 && self.files_succeeded() == 0 {
            1
        } else {
            0
        }
    }
}

/// Result of a discovery-only run
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub files_discovered: usize,
    pub procedures: BTreeMap<String, usize>,
    pub header_failures: Vec<RejectedFile>,
}
