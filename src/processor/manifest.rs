//! Manifest and rejects report for a completed run
//!
//! The manifest is one Parquet file with a row per staged file, sorted by
//! day, procedure and experiment id, so downstream code can filter the
//! dataset without opening every part file. It is fully replaced each run.

use super::staging::write_parquet_atomically;
use crate::config::{CompressionAlgorithm, StagerConfig};
use crate::constants::MANIFEST_DIR_NAME;
use crate::error::{Result, StagerError};
use crate::models::{CoercedValue, FileOutcome, ManifestRow, RejectedFile};

use polars::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Fixed manifest columns, in output order
pub const MANIFEST_COLUMNS: &[&str] = &[
    "experiment_id",
    "proc",
    "procedure",
    "day_id",
    "computer",
    "rows",
    "rel_path",
    "file_name",
    "part_path",
    "start_time",
    "start_time_source",
    "status",
    "read_strategy",
];

static MISSING_FIELD: CoercedValue = CoercedValue::Null;

/// Builds the manifest and rejects report under `<out>/_manifest/`
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    manifest_dir: PathBuf,
    dataset: String,
    manifest_fields: Vec<String>,
    compression: CompressionAlgorithm,
}

impl ManifestBuilder {
    pub fn new(config: &StagerConfig) -> Self {
        Self {
            manifest_dir: config.output_root.join(MANIFEST_DIR_NAME),
            dataset: config.dataset.clone(),
            manifest_fields: config.manifest_fields.clone(),
            compression: config.compression,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_dir.join(format!("{}.parquet", self.dataset))
    }

    pub fn rejects_path(&self) -> PathBuf {
        self.manifest_dir.join(format!("{}_rejects.json", self.dataset))
    }

    /// Manifest frame for the succeeded outcomes, or `None` when there are none
    pub fn build_frame(&self, outcomes: &[FileOutcome]) -> Result<Option<DataFrame>> {
        let entries: Vec<(&'static str, &ManifestRow)> = outcomes
            .iter()
            .filter_map(|o| o.manifest_row().map(|row| (o.status(), row)))
            .collect();

        if entries.is_empty() {
            return Ok(None);
        }

        self.assemble(&entries)
            .map(Some)
            .map_err(|e| StagerError::ManifestFailed {
                reason: e.to_string(),
            })
    }

    fn assemble(&self, entries: &[(&'static str, &ManifestRow)]) -> PolarsResult<DataFrame> {
        let rows = || entries.iter().map(|(_, row)| *row);

        let start_time = Column::new(
            "start_time".into(),
            rows()
                .map(|r| r.start_time.map(|ts| ts.timestamp_micros()))
                .collect::<Vec<Option<i64>>>(),
        )
        .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?;

        let mut columns = vec![
            Column::new(
                "experiment_id".into(),
                rows().map(|r| r.experiment_id.as_str()).collect::<Vec<_>>(),
            ),
            Column::new("proc".into(), rows().map(|r| r.proc.as_str()).collect::<Vec<_>>()),
            Column::new(
                "procedure".into(),
                rows()
                    .map(|r| r.procedure.as_deref())
                    .collect::<Vec<Option<&str>>>(),
            ),
            Column::new("day_id".into(), rows().map(|r| r.day_id.as_str()).collect::<Vec<_>>()),
            Column::new(
                "computer".into(),
                rows().map(|r| r.computer.as_str()).collect::<Vec<_>>(),
            ),
            Column::new("rows".into(), rows().map(|r| r.rows as u64).collect::<Vec<u64>>()),
            Column::new(
                "rel_path".into(),
                rows().map(|r| r.rel_path.as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "file_name".into(),
                rows().map(|r| r.file_name.as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "part_path".into(),
                rows()
                    .map(|r| r.part_path.to_string_lossy().into_owned())
                    .collect::<Vec<String>>(),
            ),
            start_time,
            Column::new(
                "start_time_source".into(),
                rows()
                    .map(|r| r.start_time_source.map(|s| s.as_str()))
                    .collect::<Vec<Option<&str>>>(),
            ),
            Column::new(
                "status".into(),
                entries.iter().map(|(status, _)| *status).collect::<Vec<_>>(),
            ),
            Column::new(
                "read_strategy".into(),
                rows()
                    .map(|r| r.read_strategy.map(|s| s.as_str()))
                    .collect::<Vec<Option<&str>>>(),
            ),
        ];

        let mut taken: HashSet<&str> = MANIFEST_COLUMNS.iter().copied().collect();
        for field in &self.manifest_fields {
            if !taken.insert(field.as_str()) {
                warn!("Manifest field '{}' clashes with a fixed column; skipped", field);
                continue;
            }
            let values: Vec<&CoercedValue> = rows()
                .map(|r| r.fields.get(field).unwrap_or(&MISSING_FIELD))
                .collect();
            columns.push(field_column(field, &values));
        }

        DataFrame::new(columns)?.sort(
            ["day_id", "proc", "experiment_id"],
            SortMultipleOptions::default().with_maintain_order(true),
        )
    }

    /// Replace the manifest; returns its path, or `None` when nothing succeeded.
    ///
    /// A manifest left by an earlier run is removed when nothing succeeded.
    pub fn write(&self, outcomes: &[FileOutcome]) -> Result<Option<PathBuf>> {
        let path = self.manifest_path();
        let Some(mut frame) = self.build_frame(outcomes)? else {
            warn!("No files were staged successfully; manifest not written");
            if path.exists() {
                std::fs::remove_file(&path)?;
                debug!("Removed stale manifest {}", path.display());
            }
            return Ok(None);
        };

        write_parquet_atomically(&mut frame, &path, self.compression)?;
        info!("Manifest with {} rows written to {}", frame.height(), path.display());
        Ok(Some(path))
    }

    /// Replace the rejects report, or remove a stale one when nothing failed
    pub fn write_rejects(&self, outcomes: &[FileOutcome]) -> Result<Option<PathBuf>> {
        let rejects: Vec<RejectedFile> = outcomes
            .iter()
            .filter_map(|o| match o {
                FileOutcome::Failed {
                    path,
                    rel_path,
                    reason,
                } => Some(RejectedFile {
                    path: path.clone(),
                    rel_path: rel_path.clone(),
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect();

        let path = self.rejects_path();
        if rejects.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path)?;
                debug!("Removed stale rejects report {}", path.display());
            }
            return Ok(None);
        }

        write_json_atomically(&rejects, &path)?;
        info!("{} rejected files listed in {}", rejects.len(), path.display());
        Ok(Some(path))
    }
}

/// Float64 when every non-null value is numeric, otherwise String
fn field_column(name: &str, values: &[&CoercedValue]) -> Column {
    let all_numeric = values
        .iter()
        .filter(|v| !v.is_null())
        .all(|v| v.as_f64().is_some());

    if all_numeric {
        Column::new(
            name.into(),
            values.iter().map(|v| v.as_f64()).collect::<Vec<Option<f64>>>(),
        )
    } else {
        Column::new(
            name.into(),
            values
                .iter()
                .map(|v| (!v.is_null()).then(|| v.to_string()))
                .collect::<Vec<Option<String>>>(),
        )
    }
}

fn write_json_atomically(rejects: &[RejectedFile], target: &Path) -> Result<()> {
    let write_failed = |reason: String| StagerError::WriteFailed {
        path: target.to_path_buf(),
        reason,
    };

    let dir = target
        .parent()
        .ok_or_else(|| write_failed("Target path has no parent directory".to_string()))?;
    std::fs::create_dir_all(dir)?;

    let tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file(), rejects)
        .map_err(|e| write_failed(e.to_string()))?;
    tmp.persist(target)
        .map_err(|e| write_failed(e.error.to_string()))?;
    Ok(())
}
