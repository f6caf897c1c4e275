//! Part-file staging for single raw files
//!
//! Chains header parsing, coercion, partitioning and the table reader for
//! one file, then writes the enriched frame as one Parquet part file under
//! its partition directory.

use crate::coercion::{coerce_header, resolve_start_time};
use crate::config::{CompressionAlgorithm, StagerConfig};
use crate::constants::{START_TIME_KEY, partition_keys};
use crate::error::{Result, StagerError};
use crate::header::try_parse_header;
use crate::models::{
    CoercedMetadata, CoercedValue, FileOutcome, ManifestRow, ParsedHeader, PartitionKey,
    ResolvedStartTime,
};
use crate::partition::{build_partition_key, relative_path};
use crate::schema::{ProcedureSchema, ProcedureSchemaCache};
use crate::table::{
    ReadStrategy, drop_all_null_columns, normalize_column_names, read_data_row_count,
    read_numeric_table,
};

use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Derived column names, in output order after the data columns
const DERIVED_COLUMNS: &[&str] = &[
    partition_keys::DAY,
    partition_keys::PROC,
    "procedure",
    partition_keys::COMPUTER,
    "rel_path",
    "file_name",
    "experiment_id",
    "start_time",
    "start_time_source",
];

/// Writer for one dataset's partition tree
#[derive(Debug, Clone)]
pub struct StagingWriter {
    dataset_root: PathBuf,
    overwrite: bool,
    pin_schema: bool,
    compression: CompressionAlgorithm,
}

impl StagingWriter {
    /// Create a new staging writer
    pub fn new(dataset_root: PathBuf, config: &StagerConfig) -> Self {
        Self {
            dataset_root,
            overwrite: config.overwrite,
            pin_schema: config.pin_schema,
            compression: config.compression,
        }
    }

    pub fn dataset_root(&self) -> &Path {
        &self.dataset_root
    }

    /// Target path of a key's part file
    pub fn part_path(&self, key: &PartitionKey) -> PathBuf {
        self.dataset_root
            .join(key.partition_dir())
            .join(key.part_file_name())
    }

    /// True when an existing part file must be kept untouched
    pub fn should_keep(&self, key: &PartitionKey) -> bool {
        !self.overwrite && self.part_path(key).is_file()
    }

    /// Enrich a data frame with derived and metadata columns and persist it.
    ///
    /// Returns the part path and the number of rows written.
    pub fn write_part(
        &self,
        frame: DataFrame,
        key: &PartitionKey,
        header: &ParsedHeader,
        coerced: &CoercedMetadata,
        start_time: Option<&ResolvedStartTime>,
        schema: Option<&ProcedureSchema>,
    ) -> Result<(PathBuf, usize)> {
        let target = self.part_path(key);
        if frame.height() == 0 {
            return Err(StagerError::NoData {
                path: PathBuf::from(&key.rel_path),
            });
        }

        let mut enriched = self
            .enrich(frame, key, header, coerced, start_time, schema)
            .map_err(|e| StagerError::WriteFailed {
                path: target.clone(),
                reason: format!("Failed to build staged frame: {}", e),
            })?;

        let rows = enriched.height();
        write_parquet_atomically(&mut enriched, &target, self.compression)?;
        debug!(
            "Wrote {} rows x {} columns to {}",
            rows,
            enriched.width(),
            target.display()
        );

        Ok((target, rows))
    }

    fn enrich(
        &self,
        frame: DataFrame,
        key: &PartitionKey,
        header: &ParsedHeader,
        coerced: &CoercedMetadata,
        start_time: Option<&ResolvedStartTime>,
        schema: Option<&ProcedureSchema>,
    ) -> PolarsResult<DataFrame> {
        let data_columns: Vec<String> = frame
            .get_column_names()
            .iter()
            .map(|n| n.to_string())
            .collect();

        let mut exprs = derived_exprs(key, header, start_time);

        let mut taken: HashSet<&str> = data_columns.iter().map(String::as_str).collect();
        taken.extend(DERIVED_COLUMNS.iter().copied());

        for (name, entry) in coerced {
            if !taken.insert(name.as_str()) {
                debug!(
                    "Metadata field '{}' clashes with an existing column in {}; not broadcast",
                    name, key.rel_path
                );
                continue;
            }
            exprs.push(value_expr(&entry.value).cast(entry.dtype()).alias(name.as_str()));
        }

        if self.pin_schema {
            if let Some(schema) = schema {
                for column in &data_columns {
                    if let Some(field_type) = schema.data_type(column) {
                        exprs.push(col(column.as_str()).cast(field_type.dtype()));
                    }
                }
            }
        }

        frame.lazy().with_columns(exprs).collect()
    }
}

/// Write a frame into a temp file beside `target` and rename it into place
pub(crate) fn write_parquet_atomically(
    frame: &mut DataFrame,
    target: &Path,
    compression: CompressionAlgorithm,
) -> Result<()> {
    let write_failed = |reason: String| StagerError::WriteFailed {
        path: target.to_path_buf(),
        reason,
    };

    let dir = target
        .parent()
        .ok_or_else(|| write_failed("Target path has no parent directory".to_string()))?;
    std::fs::create_dir_all(dir).map_err(|e| write_failed(e.to_string()))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| write_failed(e.to_string()))?;
    ParquetWriter::new(tmp.as_file_mut())
        .with_compression(compression.to_polars_compression())
        .with_statistics(StatisticsOptions::full())
        .finish(frame)
        .map_err(|e| write_failed(format!("Failed to write parquet: {}", e)))?;

    tmp.persist(target)
        .map_err(|e| write_failed(e.error.to_string()))?;
    Ok(())
}

fn derived_exprs(
    key: &PartitionKey,
    header: &ParsedHeader,
    start_time: Option<&ResolvedStartTime>,
) -> Vec<Expr> {
    let text = |value: &str, name: &str| lit(value.to_string()).alias(name);

    vec![
        text(&key.day_id, partition_keys::DAY),
        text(&key.proc, partition_keys::PROC),
        match &header.procedure {
            Some(procedure) => text(procedure, "procedure"),
            None => lit(NULL).cast(DataType::String).alias("procedure"),
        },
        text(&key.computer, partition_keys::COMPUTER),
        text(&key.rel_path, "rel_path"),
        text(&key.file_name, "file_name"),
        text(&key.experiment_id, "experiment_id"),
        timestamp_expr(start_time.map(|s| s.value)).alias("start_time"),
        match start_time {
            Some(start) => text(start.source.as_str(), "start_time_source"),
            None => lit(NULL).cast(DataType::String).alias("start_time_source"),
        },
    ]
}

fn timestamp_expr(value: Option<DateTime<Utc>>) -> Expr {
    let dtype = DataType::Datetime(TimeUnit::Microseconds, None);
    match value {
        Some(ts) => lit(ts.timestamp_micros()).cast(dtype),
        None => lit(NULL).cast(dtype),
    }
}

/// Literal expression for a coerced header value; callers cast to the column dtype
fn value_expr(value: &CoercedValue) -> Expr {
    match value {
        CoercedValue::Int(v) => lit(*v),
        CoercedValue::Float(v) => lit(*v),
        CoercedValue::Bool(v) => lit(*v),
        CoercedValue::Timestamp(ts) => timestamp_expr(Some(*ts)),
        CoercedValue::Text(v) => lit(v.clone()),
        CoercedValue::Null => lit(NULL),
    }
}

/// Everything a worker needs to stage one file; shared read-only across workers
#[derive(Debug)]
pub struct StagingContext {
    pub input_root: PathBuf,
    pub writer: StagingWriter,
    pub schemas: std::sync::Arc<ProcedureSchemaCache>,
    pub manifest_fields: Vec<String>,
    pub drop_empty_columns: bool,
    pub normalize_columns: bool,
}

impl StagingContext {
    /// Stage one raw file. Never fails: errors become `FileOutcome::Failed`.
    pub fn stage_file(&self, path: &Path) -> FileOutcome {
        let rel_path = relative_path(path, &self.input_root);
        match self.try_stage_file(path) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Failed to stage {}: {}", path.display(), e);
                FileOutcome::Failed {
                    path: path.to_path_buf(),
                    rel_path,
                    reason: e.to_string(),
                }
            }
        }
    }

    fn try_stage_file(&self, path: &Path) -> Result<FileOutcome> {
        let header = try_parse_header(path)?;
        let schema = self.schemas.procedure(&header.proc_short);
        let coerced = coerce_header(&header, schema);

        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let start_time = resolve_start_time(&header, &coerced, schema, modified);
        let key = build_partition_key(path, &self.input_root, &header, start_time.as_ref(), modified);

        if self.writer.should_keep(&key) {
            let part_path = self.writer.part_path(&key);
            match read_data_row_count(&part_path) {
                Ok(rows) => {
                    debug!("kept {} ({})", key.rel_path, part_path.display());
                    return Ok(FileOutcome::Kept(self.manifest_row(
                        &key,
                        &header,
                        &coerced,
                        start_time.as_ref(),
                        part_path,
                        rows,
                        None,
                    )));
                }
                Err(e) => warn!(
                    "Existing part {} is unreadable, rewriting it: {}",
                    part_path.display(),
                    e
                ),
            }
        }

        let read = read_numeric_table(path, header.header_lines, header.unprefixed_lines);
        let Some(strategy) = read.strategy else {
            return Err(StagerError::TableUnparseable {
                path: path.to_path_buf(),
            });
        };

        let mut frame = read.frame;
        if self.normalize_columns {
            normalize_column_names(&mut frame)?;
        }
        if self.drop_empty_columns {
            frame = drop_all_null_columns(frame)?;
        }
        if frame.height() == 0 {
            return Err(StagerError::NoData {
                path: path.to_path_buf(),
            });
        }

        let (part_path, rows) =
            self.writer
                .write_part(frame, &key, &header, &coerced, start_time.as_ref(), schema)?;
        debug!("written {} -> {}", key.rel_path, part_path.display());

        Ok(FileOutcome::Written(self.manifest_row(
            &key,
            &header,
            &coerced,
            start_time.as_ref(),
            part_path,
            rows,
            Some(strategy),
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn manifest_row(
        &self,
        key: &PartitionKey,
        header: &ParsedHeader,
        coerced: &CoercedMetadata,
        start_time: Option<&ResolvedStartTime>,
        part_path: PathBuf,
        rows: usize,
        read_strategy: Option<ReadStrategy>,
    ) -> ManifestRow {
        let fields: BTreeMap<String, CoercedValue> = self
            .manifest_fields
            .iter()
            .filter(|field| !field.eq_ignore_ascii_case(START_TIME_KEY))
            .map(|field| {
                let value = coerced
                    .get(field.as_str())
                    .or_else(|| {
                        coerced
                            .iter()
                            .find(|(k, _)| k.eq_ignore_ascii_case(field))
                            .map(|(_, entry)| entry)
                    })
                    .map(|entry| entry.value.clone())
                    .unwrap_or(CoercedValue::Null);
                (field.clone(), value)
            })
            .collect();

        ManifestRow {
            experiment_id: key.experiment_id.clone(),
            proc: key.proc.clone(),
            procedure: header.procedure.clone(),
            day_id: key.day_id.clone(),
            computer: key.computer.clone(),
            rows,
            rel_path: key.rel_path.clone(),
            file_name: key.file_name.clone(),
            part_path,
            start_time: start_time.map(|s| s.value),
            start_time_source: start_time.map(|s| s.source),
            read_strategy,
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CoercedEntry, HeaderSection, StartTimeSource};
    use crate::schema::FieldType;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn test_key() -> PartitionKey {
        PartitionKey {
            day_id: "2024-05-12".to_string(),
            proc: "IVg".to_string(),
            computer: "lab-pc".to_string(),
            experiment_id: "0123456789abcdef".to_string(),
            rel_path: "lab-pc/IVg_1.csv".to_string(),
            file_name: "IVg_1.csv".to_string(),
        }
    }

    fn test_header() -> ParsedHeader {
        ParsedHeader {
            procedure: Some("lab.IVg".to_string()),
            proc_short: "IVg".to_string(),
            ..Default::default()
        }
    }

    fn entry(value: CoercedValue, declared: Option<FieldType>) -> CoercedEntry {
        CoercedEntry {
            value,
            section: HeaderSection::Parameters,
            declared,
        }
    }

    fn read_back(path: &Path) -> DataFrame {
        ParquetReader::new(std::fs::File::open(path).unwrap())
            .finish()
            .unwrap()
    }

    #[test]
    fn test_write_part_broadcasts_metadata_and_derived_columns() {
        let temp_dir = TempDir::new().unwrap();
        let config = StagerConfig::default();
        let writer = StagingWriter::new(temp_dir.path().join("ds"), &config);

        let mut coerced = CoercedMetadata::new();
        coerced.insert("VDS".to_string(), entry(CoercedValue::Float(0.1), None));
        coerced.insert("Chip number".to_string(), entry(CoercedValue::Int(67), None));
        coerced.insert(
            "Laser wavelength".to_string(),
            entry(CoercedValue::Null, Some(FieldType::Float)),
        );
        // Clashes with a data column and must not replace it
        coerced.insert("I".to_string(), entry(CoercedValue::Text("x".into()), None));

        let start = ResolvedStartTime {
            value: Utc.with_ymd_and_hms(2024, 5, 12, 10, 0, 0).unwrap(),
            source: StartTimeSource::Header,
        };

        let frame = df!("Vg" => [-1.0, 0.0, 1.0], "I" => [1e-9, 2e-9, 3e-9]).unwrap();
        let (path, rows) = writer
            .write_part(frame, &test_key(), &test_header(), &coerced, Some(&start), None)
            .unwrap();

        assert_eq!(rows, 3);
        assert!(path.ends_with(
            "day_id=2024-05-12/proc=IVg/computer=lab-pc/part-0123456789abcdef.parquet"
        ));

        let staged = read_back(&path);
        assert_eq!(staged.height(), 3);
        assert_eq!(staged.column("I").unwrap().dtype(), &DataType::Float64);
        assert_eq!(staged.column("VDS").unwrap().dtype(), &DataType::Float64);
        assert_eq!(staged.column("Chip number").unwrap().dtype(), &DataType::Int64);
        assert_eq!(
            staged.column("Laser wavelength").unwrap().dtype(),
            &DataType::Float64
        );
        assert_eq!(staged.column("Laser wavelength").unwrap().null_count(), 3);
        assert_eq!(
            staged.column("start_time").unwrap().dtype(),
            &DataType::Datetime(TimeUnit::Microseconds, None)
        );
        for name in DERIVED_COLUMNS {
            assert!(staged.column(name).is_ok(), "missing derived column {name}");
        }

        // No temp files left beside the part
        let siblings = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(siblings, 1);
    }

    #[test]
    fn test_zero_row_frame_is_no_data() {
        let temp_dir = TempDir::new().unwrap();
        let writer = StagingWriter::new(temp_dir.path().to_path_buf(), &StagerConfig::default());
        let frame = df!("Vg" => Vec::<f64>::new()).unwrap();

        let result = writer.write_part(
            frame,
            &test_key(),
            &test_header(),
            &CoercedMetadata::new(),
            None,
            None,
        );
        assert!(matches!(result, Err(StagerError::NoData { .. })));
        assert!(!writer.part_path(&test_key()).exists());
    }

    #[test]
    fn test_pin_schema_casts_declared_data_columns() {
        let temp_dir = TempDir::new().unwrap();
        let config = StagerConfig::default().with_pin_schema(true);
        let writer = StagingWriter::new(temp_dir.path().to_path_buf(), &config);

        let schema = ProcedureSchema {
            data: [("Vg".to_string(), FieldType::Float)].into_iter().collect(),
            ..Default::default()
        };
        let frame = df!("Vg" => [1i64, 2, 3], "I" => [1i64, 2, 3]).unwrap();

        let (path, _) = writer
            .write_part(
                frame,
                &test_key(),
                &test_header(),
                &CoercedMetadata::new(),
                None,
                Some(&schema),
            )
            .unwrap();

        let staged = read_back(&path);
        assert_eq!(staged.column("Vg").unwrap().dtype(), &DataType::Float64);
        assert_eq!(staged.column("I").unwrap().dtype(), &DataType::Int64);
    }

    #[test]
    fn test_keep_policy() {
        let temp_dir = TempDir::new().unwrap();
        let keeping = StagingWriter::new(temp_dir.path().to_path_buf(), &StagerConfig::default());
        let overwriting = StagingWriter::new(
            temp_dir.path().to_path_buf(),
            &StagerConfig::default().with_overwrite(true),
        );
        let key = test_key();
        assert!(!keeping.should_keep(&key));

        let frame = df!("Vg" => [1.0]).unwrap();
        keeping
            .write_part(frame, &key, &test_header(), &CoercedMetadata::new(), None, None)
            .unwrap();

        assert!(keeping.should_keep(&key));
        assert!(!overwriting.should_keep(&key));
    }
}
