//! Best-effort typing of raw header values.
//!
//! Values with a schema-declared type are coerced to that type, degrading to
//! `Null` when they do not match; undeclared values are typed by sniffing.
//! Nothing in this module returns an error.

use crate::constants::START_TIME_KEY;
use crate::models::{
    CoercedEntry, CoercedMetadata, CoercedValue, HeaderSection, ParsedHeader, ResolvedStartTime,
    StartTimeSource,
};
use crate::schema::{FieldType, ProcedureSchema};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// First numeric substring, including scientific notation
static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?").expect("valid regex")
});

static INT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-+]?\d+$").expect("valid regex"));

static FLOAT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?(?:\d+\.\d*|\.\d+|\d+)(?:[eE][-+]?\d+)?$").expect("valid regex")
});

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Coerce a raw string to a typed value
pub fn coerce_value(raw: &str, expected: Option<FieldType>) -> CoercedValue {
    let raw = raw.trim();
    if raw.is_empty() {
        return CoercedValue::Null;
    }

    match expected {
        Some(FieldType::Int) => extract_number(raw)
            .and_then(|n| parse_int_token(&n))
            .map_or(CoercedValue::Null, CoercedValue::Int),
        Some(FieldType::Float) => extract_number(raw)
            .and_then(|n| n.parse::<f64>().ok())
            .map_or(CoercedValue::Null, CoercedValue::Float),
        Some(FieldType::Bool) => parse_bool(raw).map_or(CoercedValue::Null, CoercedValue::Bool),
        Some(FieldType::Datetime) => {
            parse_datetime(raw).map_or(CoercedValue::Null, CoercedValue::Timestamp)
        }
        Some(FieldType::Str) => CoercedValue::Text(raw.to_string()),
        None => sniff(raw),
    }
}

/// Heuristic typing for values the schema does not declare
fn sniff(raw: &str) -> CoercedValue {
    if INT_PATTERN.is_match(raw) {
        if let Ok(v) = raw.parse::<i64>() {
            return CoercedValue::Int(v);
        }
    }
    if FLOAT_PATTERN.is_match(raw) {
        if let Ok(v) = raw.parse::<f64>() {
            return CoercedValue::Float(v);
        }
    }
    if raw.eq_ignore_ascii_case("true") {
        return CoercedValue::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return CoercedValue::Bool(false);
    }
    CoercedValue::Text(raw.to_string())
}

fn extract_number(raw: &str) -> Option<String> {
    NUMBER.find(raw).map(|m| m.as_str().to_string())
}

/// Integer from a numeric token; integral floats like `1e3` or `67.0` are accepted
fn parse_int_token(token: &str) -> Option<i64> {
    if let Ok(v) = token.parse::<i64>() {
        return Some(v);
    }
    let v = token.parse::<f64>().ok()?;
    if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Parse epoch seconds or an ISO-8601 string; naive times are taken as UTC
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if FLOAT_PATTERN.is_match(raw) {
        let secs = raw.parse::<f64>().ok()?;
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
        return DateTime::from_timestamp(whole as i64, nanos);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Coerce every header field, using the procedure schema where it declares a type.
///
/// When a key appears in both sections the `Parameters` value is kept.
pub fn coerce_header(header: &ParsedHeader, schema: Option<&ProcedureSchema>) -> CoercedMetadata {
    let mut coerced = CoercedMetadata::new();
    for (section, key, raw) in header.entries() {
        if coerced.contains_key(key) {
            continue;
        }
        let declared = schema.and_then(|s| s.field_type(section, key));
        coerced.insert(
            key.to_string(),
            CoercedEntry {
                value: coerce_value(raw, declared),
                section,
                declared,
            },
        );
    }
    coerced
}

/// Resolve the measurement start time.
///
/// Order: schema-declared `Start time` metadata, then the raw header
/// start-time line, then the file's modification time.
pub fn resolve_start_time(
    header: &ParsedHeader,
    coerced: &CoercedMetadata,
    schema: Option<&ProcedureSchema>,
    modified: Option<DateTime<Utc>>,
) -> Option<ResolvedStartTime> {
    let schema_declares_start = schema
        .and_then(|s| s.field_type(HeaderSection::Metadata, START_TIME_KEY))
        .is_some_and(|t| t == FieldType::Datetime);

    if schema_declares_start {
        let from_schema = coerced
            .iter()
            .find(|(key, entry)| {
                entry.section == HeaderSection::Metadata
                    && key.trim().eq_ignore_ascii_case(START_TIME_KEY)
            })
            .and_then(|(_, entry)| match entry.value {
                CoercedValue::Timestamp(ts) => Some(ts),
                _ => None,
            });
        if let Some(value) = from_schema {
            return Some(ResolvedStartTime {
                value,
                source: StartTimeSource::Schema,
            });
        }
    }

    if let Some(value) = header.start_time_raw.as_deref().and_then(parse_datetime) {
        return Some(ResolvedStartTime {
            value,
            source: StartTimeSource::Header,
        });
    }

    modified.map(|value| ResolvedStartTime {
        value,
        source: StartTimeSource::FileModified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::parse_header_lines;
    use crate::schema::ProcedureSchemas;
    use chrono::{Datelike, TimeZone, Timelike};

    #[test]
    fn test_declared_numeric_ignores_units() {
        assert_eq!(
            coerce_value("0.1 V", Some(FieldType::Float)),
            CoercedValue::Float(0.1)
        );
        assert_eq!(
            coerce_value("455.0 nm", Some(FieldType::Float)),
            CoercedValue::Float(455.0)
        );
        assert_eq!(
            coerce_value("-3.5e-9 A", Some(FieldType::Float)),
            CoercedValue::Float(-3.5e-9)
        );
        assert_eq!(
            coerce_value("chip 67", Some(FieldType::Int)),
            CoercedValue::Int(67)
        );
        assert_eq!(
            coerce_value("1e3", Some(FieldType::Int)),
            CoercedValue::Int(1000)
        );
    }

    #[test]
    fn test_numeric_mismatch_degrades_to_null() {
        assert_eq!(
            coerce_value("n/a", Some(FieldType::Float)),
            CoercedValue::Null
        );
        assert_eq!(
            coerce_value("2.5", Some(FieldType::Int)),
            CoercedValue::Null
        );
        assert_eq!(
            coerce_value("maybe", Some(FieldType::Bool)),
            CoercedValue::Null
        );
        assert_eq!(coerce_value("", Some(FieldType::Str)), CoercedValue::Null);
    }

    #[test]
    fn test_declared_datetime_accepts_epoch_and_iso() {
        let epoch = coerce_value("1717000000", Some(FieldType::Datetime));
        assert_eq!(
            epoch,
            CoercedValue::Timestamp(Utc.timestamp_opt(1_717_000_000, 0).unwrap())
        );

        match coerce_value("2024-05-12T10:30:00", Some(FieldType::Datetime)) {
            CoercedValue::Timestamp(ts) => {
                assert_eq!(ts.year(), 2024);
                assert_eq!(ts.hour(), 10);
            }
            other => panic!("expected timestamp, got {:?}", other),
        }

        match coerce_value("2024-05-12T10:30:00-04:00", Some(FieldType::Datetime)) {
            CoercedValue::Timestamp(ts) => assert_eq!(ts.hour(), 14),
            other => panic!("expected timestamp, got {:?}", other),
        }

        assert_eq!(
            coerce_value("yesterday", Some(FieldType::Datetime)),
            CoercedValue::Null
        );
    }

    #[test]
    fn test_fractional_epoch_keeps_subseconds() {
        let ts = parse_datetime("1717000000.5").unwrap();
        assert_eq!(ts.timestamp(), 1_717_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_heuristic_sniffing() {
        assert_eq!(coerce_value("42", None), CoercedValue::Int(42));
        assert_eq!(coerce_value("-1.5e-3", None), CoercedValue::Float(-1.5e-3));
        assert_eq!(coerce_value("TRUE", None), CoercedValue::Bool(true));
        assert_eq!(coerce_value("false", None), CoercedValue::Bool(false));
        assert_eq!(
            coerce_value("0.1 V", None),
            CoercedValue::Text("0.1 V".to_string())
        );
        assert_eq!(coerce_value("   ", None), CoercedValue::Null);
    }

    #[test]
    fn test_coerce_header_uses_schema_and_prefers_parameters() {
        let schemas = ProcedureSchemas::from_yaml(
            "procedures:\n  IVg:\n    Parameters:\n      VDS: float\n    Metadata:\n      Start time: datetime\n",
        )
        .unwrap();
        let content = "#Procedure: <lab.IVg>\n#Parameters:\n#\tVDS: 0.1 V\n#\tNote: 12\n#Metadata:\n#\tNote: duplicate\n#\tStart time: 1717000000\n#Data:\n";
        let header = parse_header_lines(content.lines(), "x.csv");
        let coerced = coerce_header(&header, schemas.get("IVg"));

        assert_eq!(coerced["VDS"].value, CoercedValue::Float(0.1));
        assert_eq!(coerced["VDS"].declared, Some(FieldType::Float));
        assert_eq!(coerced["Note"].value, CoercedValue::Int(12));
        assert_eq!(coerced["Note"].section, HeaderSection::Parameters);
        assert!(matches!(
            coerced["Start time"].value,
            CoercedValue::Timestamp(_)
        ));
    }

    #[test]
    fn test_start_time_resolution_order() {
        let schemas = ProcedureSchemas::from_yaml(
            "procedures:\n  It:\n    Metadata:\n      Start time: datetime\n",
        )
        .unwrap();
        let schema = schemas.get("It");
        let mtime = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();

        let with_start = parse_header_lines(
            "#Procedure: lab.It\n#Metadata:\n#\tStart time: 1717000000\n#Data:\n".lines(),
            "x.csv",
        );
        let coerced = coerce_header(&with_start, schema);
        let resolved = resolve_start_time(&with_start, &coerced, schema, Some(mtime)).unwrap();
        assert_eq!(resolved.source, StartTimeSource::Schema);

        let coerced = coerce_header(&with_start, None);
        let resolved = resolve_start_time(&with_start, &coerced, None, Some(mtime)).unwrap();
        assert_eq!(resolved.source, StartTimeSource::Header);
        assert_eq!(resolved.value.timestamp(), 1_717_000_000);
    }

    #[test]
    fn test_start_time_falls_back_to_mtime() {
        let header = parse_header_lines("#Procedure: lab.It\n#Data:\n".lines(), "x.csv");
        let coerced = coerce_header(&header, None);
        let mtime = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();

        let resolved = resolve_start_time(&header, &coerced, None, Some(mtime)).unwrap();
        assert_eq!(resolved.source, StartTimeSource::FileModified);
        assert_eq!(resolved.value, mtime);
    }

    #[test]
    fn test_unparseable_header_start_time_falls_back() {
        let header = parse_header_lines(
            "#Metadata:\n#\tStart time: sometime soon\n#Data:\n".lines(),
            "x.csv",
        );
        let coerced = coerce_header(&header, None);
        let mtime = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        let resolved = resolve_start_time(&header, &coerced, None, Some(mtime)).unwrap();
        assert_eq!(resolved.source, StartTimeSource::FileModified);
    }
}
