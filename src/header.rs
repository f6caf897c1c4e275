//! Instrument comment-header parsing.
//!
//! Streams the leading lines of a raw file, extracting the declared
//! procedure, `Parameters`/`Metadata` key/value pairs and the start time,
//! and stops at the `# Data:` marker so the data block is never scanned.
//! A stray line without the `#` prefix inside the header does not end it;
//! without a marker the header is the leading run of comment lines.

use crate::constants::{
    BOUNDED_FILENAME_TOKENS, COMMENT_PREFIX, HEADER_LOOKAHEAD_LINES, PROC_FILENAME_TOKENS,
    UNKNOWN_PROC, UTF8_BOM, sections,
};
use crate::error::{Result, StagerError};
use crate::models::{HeaderSection, ParsedHeader};
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

static PROCEDURE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*#\s*procedure\s*:\s*<?\s*([^<>]*?)\s*>?\s*$").expect("valid regex")
});

static SECTION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*#\s*(parameters|metadata|data)\s*:\s*$").expect("valid regex")
});

static KEY_VALUE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#\s*([^:]*[^:\s])\s*:\s*(.*?)\s*$").expect("valid regex"));

static START_TIME_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*#\s*start[\s_]*time\s*:\s*(.*?)\s*$").expect("valid regex")
});

/// Classification of a single header line
#[derive(Debug, PartialEq)]
enum HeaderLine<'a> {
    Procedure(&'a str),
    Section(&'a str),
    StartTime(&'a str),
    KeyValue(&'a str, &'a str),
    Comment,
    Blank,
    Data,
}

fn classify(line: &str) -> HeaderLine<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return HeaderLine::Blank;
    }
    if !trimmed.starts_with(COMMENT_PREFIX) {
        return HeaderLine::Data;
    }
    if let Some(caps) = PROCEDURE_LINE.captures(line) {
        return HeaderLine::Procedure(caps.get(1).map_or("", |m| m.as_str()));
    }
    if let Some(caps) = SECTION_LINE.captures(line) {
        return HeaderLine::Section(caps.get(1).map_or("", |m| m.as_str()));
    }
    if let Some(caps) = START_TIME_LINE.captures(line) {
        return HeaderLine::StartTime(caps.get(1).map_or("", |m| m.as_str()));
    }
    if let Some(caps) = KEY_VALUE_LINE.captures(line) {
        let key = caps.get(1).map_or("", |m| m.as_str());
        let value = caps.get(2).map_or("", |m| m.as_str());
        return HeaderLine::KeyValue(key, value);
    }
    HeaderLine::Comment
}

/// Line text without its terminator, and without a byte-order mark on the first line
fn clean_line(line: &str, index: usize) -> &str {
    let line = line.trim_end_matches(['\r', '\n']);
    if index == 0 {
        line.trim_start_matches(UTF8_BOM)
    } else {
        line
    }
}

fn is_data_marker(line: &HeaderLine<'_>) -> bool {
    matches!(line, HeaderLine::Section(name) if name.eq_ignore_ascii_case(sections::DATA))
}

/// Tracks where the header ends while lines are fed in file order
#[derive(Debug, Default)]
struct HeaderExtent {
    seen: usize,
    first_unprefixed: Option<usize>,
    marker: Option<usize>,
}

impl HeaderExtent {
    /// Feed the next line; returns false once no later line can belong to the header
    fn push(&mut self, line: &str) -> bool {
        let index = self.seen;
        self.seen += 1;

        let kind = classify(clean_line(line, index));
        if is_data_marker(&kind) {
            self.marker = Some(index);
            return false;
        }
        if kind == HeaderLine::Data {
            self.first_unprefixed.get_or_insert(index);
        }
        match self.first_unprefixed {
            Some(first) => index - first < HEADER_LOOKAHEAD_LINES,
            None => true,
        }
    }

    /// Number of leading lines that make up the header
    fn len(&self) -> usize {
        match self.marker {
            Some(marker) => marker + 1,
            None => self.first_unprefixed.unwrap_or(self.seen),
        }
    }
}

/// Parse a file's header, returning an empty record on I/O failure
pub fn parse_header(file_path: &Path) -> ParsedHeader {
    match try_parse_header(file_path) {
        Ok(header) => header,
        Err(e) => {
            warn!("{}", e);
            ParsedHeader::default()
        }
    }
}

/// Parse a file's header, reporting I/O failures
pub fn try_parse_header(file_path: &Path) -> Result<ParsedHeader> {
    let file = File::open(file_path).map_err(|e| StagerError::HeaderUnreadable {
        path: file_path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    let mut lines = Vec::new();
    let mut extent = HeaderExtent::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| StagerError::HeaderUnreadable {
                path: file_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if read == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        let more = extent.push(&line);
        lines.push(line);
        if !more {
            break;
        }
    }

    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let header = parse_header_lines(lines, &file_name);

    debug!(
        "Parsed header for {}: proc={}, header_lines={}, params={}, metadata={}",
        file_path.display(),
        header.proc_short,
        header.header_lines,
        header.parameters.len(),
        header.metadata.len()
    );
    if header.unprefixed_lines > 0 {
        debug!(
            "{} header lines of {} lack the comment prefix",
            header.unprefixed_lines,
            file_path.display()
        );
    }

    Ok(header)
}

/// Parse header lines already in memory.
///
/// Consumes lines until the data marker (inclusive). Lines without the
/// comment prefix before the marker are counted but carry no fields. When no
/// marker turns up within a bounded look-ahead, the header ends at the first
/// non-comment line (exclusive); nothing after that point is examined.
pub fn parse_header_lines<I, S>(lines: I, file_name: &str) -> ParsedHeader
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut extent = HeaderExtent::default();
    let mut block = Vec::new();
    for line in lines {
        let more = extent.push(line.as_ref());
        block.push(line);
        if !more {
            break;
        }
    }
    block.truncate(extent.len());

    let mut header = ParsedHeader::default();
    let mut section = HeaderSection::Parameters;

    for (index, line) in block.iter().enumerate() {
        let line = clean_line(line.as_ref(), index);
        match classify(line) {
            HeaderLine::Data => {
                header.header_lines += 1;
                header.unprefixed_lines += 1;
            }
            HeaderLine::Section(name) if name.eq_ignore_ascii_case(sections::DATA) => {
                header.header_lines += 1;
                header.data_marker_found = true;
                break;
            }
            HeaderLine::Section(name) => {
                header.header_lines += 1;
                if name.eq_ignore_ascii_case(sections::METADATA) {
                    section = HeaderSection::Metadata;
                } else if name.eq_ignore_ascii_case(sections::PARAMETERS) {
                    section = HeaderSection::Parameters;
                }
            }
            HeaderLine::Procedure(name) => {
                header.header_lines += 1;
                if !name.is_empty() && header.procedure.is_none() {
                    header.procedure = Some(name.to_string());
                }
            }
            HeaderLine::StartTime(value) => {
                header.header_lines += 1;
                if header.start_time_raw.is_none() && !value.is_empty() {
                    header.start_time_raw = Some(value.to_string());
                }
                let key = line
                    .trim_start()
                    .trim_start_matches(COMMENT_PREFIX)
                    .split(':')
                    .next()
                    .unwrap_or(crate::constants::START_TIME_KEY)
                    .trim();
                insert_first(&mut header, section, key, value);
            }
            HeaderLine::KeyValue(key, value) => {
                header.header_lines += 1;
                if key.eq_ignore_ascii_case(sections::PROCEDURE) {
                    continue;
                }
                insert_first(&mut header, section, key, value);
            }
            HeaderLine::Comment | HeaderLine::Blank => {
                header.header_lines += 1;
            }
        }
    }

    header.proc_short = match header.procedure.as_deref() {
        Some(full) => short_proc_name(full),
        None => infer_proc_from_filename(file_name)
            .unwrap_or(UNKNOWN_PROC)
            .to_string(),
    };

    header
}

fn insert_first(header: &mut ParsedHeader, section: HeaderSection, key: &str, value: &str) {
    let target = match section {
        HeaderSection::Parameters => &mut header.parameters,
        HeaderSection::Metadata => &mut header.metadata,
    };
    target
        .entry(key.to_string())
        .or_insert_with(|| value.to_string());
}

/// Short code of a fully qualified procedure name: its last dotted segment
pub fn short_proc_name(full: &str) -> String {
    let short = full
        .trim()
        .rsplit('.')
        .find(|segment| !segment.trim().is_empty())
        .unwrap_or(UNKNOWN_PROC)
        .trim();
    if short.is_empty() {
        UNKNOWN_PROC.to_string()
    } else {
        short.to_string()
    }
}

/// Infer a procedure code from filename tokens in fixed precedence order.
///
/// Tokens match anywhere in the stem except `it`, which must not touch an
/// ASCII letter on either side so it never matches inside `iv` names or
/// ordinary words.
pub fn infer_proc_from_filename(file_name: &str) -> Option<&'static str> {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    PROC_FILENAME_TOKENS
        .iter()
        .find(|(token, _)| {
            if BOUNDED_FILENAME_TOKENS.contains(token) {
                contains_bounded(&stem, token)
            } else {
                stem.contains(token)
            }
        })
        .map(|(_, code)| *code)
}

fn contains_bounded(haystack: &str, token: &str) -> bool {
    let bytes = haystack.as_bytes();
    haystack.match_indices(token).any(|(start, _)| {
        let end = start + token.len();
        let before_ok = start == 0 || !bytes[start - 1].is_ascii_alphabetic();
        let after_ok = end >= bytes.len() || !bytes[end].is_ascii_alphabetic();
        before_ok && after_ok
    })
}
