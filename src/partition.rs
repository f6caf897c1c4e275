//! Partition key resolution for raw files.
//!
//! Every staged file lands under `day_id=<D>/proc=<P>/computer=<C>` and is
//! identified by a digest of its path relative to the ingestion root, so the
//! same tree staged on two machines yields the same identifiers.

use crate::constants::{EXPERIMENT_ID_LEN, UNKNOWN_PARTITION};
use crate::models::{ParsedHeader, PartitionKey, ResolvedStartTime};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Component, Path};
use std::sync::LazyLock;

/// `YYYY-MM-DD`, `YYYY_MM_DD` or `YYYYMMDD` not embedded in a longer digit run
static PATH_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^0-9])((?:19|20)\d{2})[-_]?(\d{2})[-_]?(\d{2})(?:[^0-9]|$)")
        .expect("valid regex")
});

/// Path relative to `root`, `/`-separated; falls back to the full path
pub fn relative_path(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// First 16 hex characters of the SHA-256 of the relative path
pub fn experiment_id(rel_path: &str) -> String {
    let digest = Sha256::digest(rel_path.as_bytes());
    let mut hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(EXPERIMENT_ID_LEN);
    hex
}

/// Acquisition computer: the first directory below the root
pub fn computer_tag(rel_path: &str) -> String {
    let mut parts = rel_path.split('/').filter(|p| !p.is_empty());
    match (parts.next(), parts.next()) {
        (Some(first), Some(_)) => first.to_string(),
        _ => UNKNOWN_PARTITION.to_string(),
    }
}

/// First valid calendar date embedded in a path string
pub fn date_from_path(rel_path: &str) -> Option<NaiveDate> {
    // Overlapping candidates: retry after each rejected match start
    let mut offset = 0;
    while offset < rel_path.len() {
        let caps = PATH_DATE.captures(&rel_path[offset..])?;
        let whole = caps.get(0)?;
        let parsed = (|| {
            let year = caps.get(1)?.as_str().parse().ok()?;
            let month = caps.get(2)?.as_str().parse().ok()?;
            let day = caps.get(3)?.as_str().parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, day)
        })();
        if parsed.is_some() {
            return parsed;
        }
        offset += whole.start() + 1;
        while !rel_path.is_char_boundary(offset) {
            offset += 1;
        }
    }
    None
}

/// Day partition: header time, then path date, then mtime, then `unknown`
pub fn resolve_day_id(
    start_time: Option<&ResolvedStartTime>,
    rel_path: &str,
    modified: Option<DateTime<Utc>>,
) -> String {
    if let Some(start) = start_time.filter(|s| s.source.is_parsed()) {
        return start.value.format("%Y-%m-%d").to_string();
    }
    if let Some(date) = date_from_path(rel_path) {
        return date.format("%Y-%m-%d").to_string();
    }
    if let Some(modified) = modified {
        return modified.format("%Y-%m-%d").to_string();
    }
    UNKNOWN_PARTITION.to_string()
}

/// Make a value safe for a `key=value` directory name
pub fn sanitize_partition_value(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '=' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() {
        UNKNOWN_PARTITION.to_string()
    } else {
        cleaned
    }
}

/// Resolve the full partition key of one file
pub fn build_partition_key(
    path: &Path,
    root: &Path,
    header: &ParsedHeader,
    start_time: Option<&ResolvedStartTime>,
    modified: Option<DateTime<Utc>>,
) -> PartitionKey {
    let rel_path = relative_path(path, root);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    PartitionKey {
        day_id: sanitize_partition_value(&resolve_day_id(start_time, &rel_path, modified)),
        proc: sanitize_partition_value(&header.proc_short),
        computer: sanitize_partition_value(&computer_tag(&rel_path)),
        experiment_id: experiment_id(&rel_path),
        rel_path,
        file_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StartTimeSource;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn start(source: StartTimeSource) -> ResolvedStartTime {
        ResolvedStartTime {
            value: Utc.with_ymd_and_hms(2024, 5, 12, 23, 30, 0).unwrap(),
            source,
        }
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = PathBuf::from("/data/raw");
        let path = root.join("lab-pc").join("2024-05-12").join("IVg_1.csv");
        assert_eq!(relative_path(&path, &root), "lab-pc/2024-05-12/IVg_1.csv");
    }

    #[test]
    fn test_experiment_id_is_stable_and_short() {
        let a = experiment_id("lab-pc/2024-05-12/IVg_1.csv");
        let b = experiment_id("lab-pc/2024-05-12/IVg_1.csv");
        let c = experiment_id("lab-pc/2024-05-12/IVg_2.csv");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), EXPERIMENT_ID_LEN);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
        // sha256("abc")
        assert_eq!(experiment_id("abc"), "ba7816bf8f01cfea");
    }

    #[test]
    fn test_computer_tag() {
        assert_eq!(computer_tag("lab-pc/2024/IVg.csv"), "lab-pc");
        assert_eq!(computer_tag("IVg.csv"), UNKNOWN_PARTITION);
    }

    #[test]
    fn test_date_from_path_variants() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 12);
        assert_eq!(date_from_path("pc/2024-05-12/run.csv"), expected);
        assert_eq!(date_from_path("pc/2024_05_12/run.csv"), expected);
        assert_eq!(date_from_path("pc/IVg_20240512_a.csv"), expected);
        assert_eq!(date_from_path("pc/run.csv"), None);
    }

    #[test]
    fn test_date_from_path_rejects_invalid_and_embedded_dates() {
        assert_eq!(date_from_path("pc/2024-13-45/run.csv"), None);
        assert_eq!(date_from_path("pc/id120240512999.csv"), None);
        assert_eq!(
            date_from_path("pc/20241399/2023-01-02.csv"),
            NaiveDate::from_ymd_opt(2023, 1, 2)
        );
    }

    #[test]
    fn test_day_id_precedence() {
        let header_time = start(StartTimeSource::Header);
        let mtime = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(
            resolve_day_id(Some(&header_time), "pc/2023-01-02/a.csv", Some(mtime)),
            "2024-05-12"
        );

        // An mtime-derived start time does not outrank a date in the path
        let mtime_start = start(StartTimeSource::FileModified);
        assert_eq!(
            resolve_day_id(Some(&mtime_start), "pc/2023-01-02/a.csv", Some(mtime)),
            "2023-01-02"
        );
        assert_eq!(resolve_day_id(None, "pc/a.csv", Some(mtime)), "2020-01-01");
        assert_eq!(resolve_day_id(None, "pc/a.csv", None), UNKNOWN_PARTITION);
    }

    #[test]
    fn test_sanitize_partition_value() {
        assert_eq!(sanitize_partition_value("lab pc/2"), "lab_pc_2");
        assert_eq!(sanitize_partition_value("a=b\\c"), "a_b_c");
        assert_eq!(sanitize_partition_value("   "), UNKNOWN_PARTITION);
    }

    #[test]
    fn test_build_partition_key() {
        let root = PathBuf::from("/data/raw");
        let path = root.join("Lab PC").join("IVg_run.csv");
        let header = ParsedHeader {
            proc_short: "IVg".to_string(),
            ..Default::default()
        };
        let start_time = start(StartTimeSource::Header);

        let key = build_partition_key(&path, &root, &header, Some(&start_time), None);

        assert_eq!(key.day_id, "2024-05-12");
        assert_eq!(key.proc, "IVg");
        assert_eq!(key.computer, "Lab_PC");
        assert_eq!(key.rel_path, "Lab PC/IVg_run.csv");
        assert_eq!(key.file_name, "IVg_run.csv");
        assert_eq!(key.experiment_id, experiment_id("Lab PC/IVg_run.csv"));
        assert_eq!(
            key.partition_dir(),
            PathBuf::from("day_id=2024-05-12/proc=IVg/computer=Lab_PC")
        );
    }
}
