//! Numeric data-block reader with a four-level fallback chain.
//!
//! Each strategy is more permissive than the last and is only tried when the
//! previous one failed. The chain never propagates a parse error: when every
//! strategy fails the caller receives an empty frame and no strategy.

use crate::constants::{
    COLUMN_SYNONYMS, COMMENT_PREFIX, INFER_SCHEMA_ROWS, LOSSY_INFER_SCHEMA_ROWS,
};
use polars::prelude::*;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Trailing unit annotation such as `(V)` or `[A]`
static UNIT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)\s*[\(\[][^\)\]]*[\)\]]\s*$").expect("valid regex"));

/// CSV read strategies in order of increasing permissiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadStrategy {
    /// Skip `#` lines, infer header and dtypes, parse dates.
    /// Not applicable when a header line lacks the prefix.
    CommentStripped,
    /// Skip exactly the counted header lines instead of relying on the prefix
    ExplicitSkipRows,
    /// As above with quote handling disabled
    QuoteAgnostic,
    /// Small inference sample, no dates, lossy UTF-8, malformed rows dropped
    Lossy,
}

impl ReadStrategy {
    pub const CHAIN: [ReadStrategy; 4] = [
        ReadStrategy::CommentStripped,
        ReadStrategy::ExplicitSkipRows,
        ReadStrategy::QuoteAgnostic,
        ReadStrategy::Lossy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStrategy::CommentStripped => "comment_stripped",
            ReadStrategy::ExplicitSkipRows => "explicit_skip_rows",
            ReadStrategy::QuoteAgnostic => "quote_agnostic",
            ReadStrategy::Lossy => "lossy",
        }
    }

    /// Polars reader options for this strategy
    pub fn csv_options(&self, header_lines: usize) -> CsvReadOptions {
        let base = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(INFER_SCHEMA_ROWS))
            .with_rechunk(true);

        match self {
            ReadStrategy::CommentStripped => base.map_parse_options(|opts| {
                opts.with_comment_prefix(Some(COMMENT_PREFIX))
                    .with_truncate_ragged_lines(true)
                    .with_try_parse_dates(true)
            }),
            ReadStrategy::ExplicitSkipRows => {
                base.with_skip_rows(header_lines).map_parse_options(|opts| {
                    opts.with_truncate_ragged_lines(true)
                        .with_try_parse_dates(true)
                })
            }
            ReadStrategy::QuoteAgnostic => {
                base.with_skip_rows(header_lines).map_parse_options(|opts| {
                    opts.with_quote_char(None)
                        .with_truncate_ragged_lines(true)
                        .with_try_parse_dates(true)
                })
            }
            ReadStrategy::Lossy => base
                .with_skip_rows(header_lines)
                .with_infer_schema_length(Some(LOSSY_INFER_SCHEMA_ROWS))
                .with_ignore_errors(true)
                .map_parse_options(|opts| {
                    opts.with_quote_char(None)
                        .with_truncate_ragged_lines(true)
                        .with_try_parse_dates(false)
                        .with_encoding(CsvEncoding::LossyUtf8)
                }),
        }
    }
}

impl fmt::Display for ReadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running the fallback chain on one file
#[derive(Debug, Clone)]
pub struct TableRead {
    pub frame: DataFrame,
    /// Strategy that produced `frame`; `None` when every strategy failed
    pub strategy: Option<ReadStrategy>,
    /// Failed attempts with their reasons, in order
    pub attempts: Vec<(ReadStrategy, String)>,
}

impl TableRead {
    pub fn is_parsed(&self) -> bool {
        self.strategy.is_some()
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }
}

/// Read a file's data block, trying each strategy in turn.
///
/// `unprefixed_lines` counts header lines without the comment prefix; when
/// there are any, only the strategies that skip `header_lines` can find the
/// column header.
pub fn read_numeric_table(
    file_path: &Path,
    header_lines: usize,
    unprefixed_lines: usize,
) -> TableRead {
    let read = run_fallback_chain(|strategy| {
        if strategy == ReadStrategy::CommentStripped && unprefixed_lines > 0 {
            return Err(PolarsError::ComputeError(
                format!("{unprefixed_lines} header lines lack the comment prefix").into(),
            ));
        }
        read_with_strategy(file_path, header_lines, strategy)
    });

    match read.strategy {
        Some(strategy) => debug!(
            "Read {} rows x {} columns from {} using {}",
            read.frame.height(),
            read.frame.width(),
            file_path.display(),
            strategy
        ),
        None => warn!(
            "All read strategies failed for {}: {:?}",
            file_path.display(),
            read.attempts
        ),
    }

    read
}

fn read_with_strategy(
    file_path: &Path,
    header_lines: usize,
    strategy: ReadStrategy,
) -> PolarsResult<DataFrame> {
    strategy
        .csv_options(header_lines)
        .try_into_reader_with_file_path(Some(file_path.to_path_buf()))?
        .finish()
}

/// Drive the chain with an arbitrary attempt function.
///
/// A strategy fails when it errors or yields a frame without columns.
pub fn run_fallback_chain<F, E>(mut attempt: F) -> TableRead
where
    F: FnMut(ReadStrategy) -> std::result::Result<DataFrame, E>,
    E: fmt::Display,
{
    let mut attempts = Vec::new();

    for strategy in ReadStrategy::CHAIN {
        match attempt(strategy) {
            Ok(frame) if frame.width() > 0 => {
                return TableRead {
                    frame,
                    strategy: Some(strategy),
                    attempts,
                };
            }
            Ok(_) => attempts.push((strategy, "no columns".to_string())),
            Err(e) => attempts.push((strategy, e.to_string())),
        }
    }

    TableRead {
        frame: DataFrame::empty(),
        strategy: None,
        attempts,
    }
}

/// Canonical name for a raw column header: units stripped, synonyms mapped
pub fn canonical_column_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = UNIT_SUFFIX
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(trimmed);

    let lowered = stripped.to_ascii_lowercase();
    COLUMN_SYNONYMS
        .iter()
        .find(|(_, synonyms)| synonyms.contains(&lowered.as_str()))
        .map(|(canonical, _)| canonical.to_string())
        .unwrap_or_else(|| stripped.to_string())
}

/// Rename columns to canonical names; a name already taken keeps its original
pub fn normalize_column_names(frame: &mut DataFrame) -> PolarsResult<()> {
    let originals: Vec<String> = frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    let mut used: HashSet<String> = HashSet::new();
    let mut renamed = Vec::with_capacity(originals.len());

    for (i, original) in originals.iter().enumerate() {
        let candidate = canonical_column_name(original);
        let clashes_with_other = originals
            .iter()
            .enumerate()
            .any(|(j, other)| j != i && *other == candidate);

        let name = if candidate != *original && (used.contains(&candidate) || clashes_with_other)
        {
            original.clone()
        } else {
            candidate
        };

        let name = if used.contains(&name) {
            format!("{name}_{i}")
        } else {
            name
        };
        used.insert(name.clone());
        renamed.push(name);
    }

    if renamed != originals {
        debug!("Normalised columns {:?} -> {:?}", originals, renamed);
        frame.set_column_names(renamed)?;
    }
    Ok(())
}

/// Drop columns in which every value is null
pub fn drop_all_null_columns(frame: DataFrame) -> PolarsResult<DataFrame> {
    if frame.height() == 0 {
        return Ok(frame);
    }

    let keep: Vec<String> = frame
        .get_columns()
        .iter()
        .filter(|column| column.null_count() < column.len())
        .map(|column| column.name().to_string())
        .collect();

    if keep.len() == frame.width() {
        Ok(frame)
    } else {
        frame.select(keep)
    }
}

/// Row count of an already-staged part file, read from its footer
pub fn read_data_row_count(part_path: &Path) -> PolarsResult<usize> {
    let file = std::fs::File::open(part_path)?;
    ParquetReader::new(file).num_rows()
}
