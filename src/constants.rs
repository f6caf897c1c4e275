//! Application constants for the staging pipeline
//!
//! Header markers, partition key names, read-strategy tuning and the
//! column-name synonym table shared across modules.

// =============================================================================
// Header Format
// =============================================================================

/// Prefix that marks a header comment line
pub const COMMENT_PREFIX: &str = "#";

/// Section names recognised in the header (compared case-insensitively)
pub mod sections {
    pub const PROCEDURE: &str = "procedure";
    pub const PARAMETERS: &str = "parameters";
    pub const METADATA: &str = "metadata";
    pub const DATA: &str = "data";
}

/// Metadata key holding the measurement start time
pub const START_TIME_KEY: &str = "Start time";

/// Short procedure code used when neither header nor filename reveal one
pub const UNKNOWN_PROC: &str = "unknown";

/// Filename tokens used to infer a procedure, in precedence order.
///
/// Longer tokens that contain shorter ones must come first.
pub const PROC_FILENAME_TOKENS: &[(&str, &str)] = &[
    ("lasercalibration", "LaserCalibration"),
    ("ivgt", "IVgT"),
    ("ivg", "IVg"),
    ("vvg", "VVg"),
    ("vt", "Vt"),
    ("its", "ITS"),
    ("it", "It"),
    ("iv", "IV"),
];

/// Filename tokens that only match when no ASCII letter touches either side
pub const BOUNDED_FILENAME_TOKENS: &[&str] = &["it"];

/// Lines scanned past the first un-prefixed line while looking for the data marker
pub const HEADER_LOOKAHEAD_LINES: usize = 32;

/// Byte-order mark some acquisition software writes before the first line
pub const UTF8_BOM: char = '\u{feff}';

// =============================================================================
// Partitioning
// =============================================================================

/// Partition directory keys
pub mod partition_keys {
    pub const DAY: &str = "day_id";
    pub const PROC: &str = "proc";
    pub const COMPUTER: &str = "computer";
}

/// Fallback value for any partition key that cannot be resolved
pub const UNKNOWN_PARTITION: &str = "unknown";

/// Number of hex characters kept from the path digest
pub const EXPERIMENT_ID_LEN: usize = 16;

/// Extension of staged part files
pub const PART_FILE_EXTENSION: &str = "parquet";

/// Directory under the output root that holds the manifest and rejects report
pub const MANIFEST_DIR_NAME: &str = "_manifest";

// =============================================================================
// Table Reading
// =============================================================================

/// Rows sampled for dtype inference by the strict read strategies
pub const INFER_SCHEMA_ROWS: usize = 10_000;

/// Rows sampled for dtype inference by the lossy last-resort strategy
pub const LOSSY_INFER_SCHEMA_ROWS: usize = 200;

/// Canonical data column names and the lowercase synonyms mapped onto them
pub const COLUMN_SYNONYMS: &[(&str, &[&str])] = &[
    ("Vg", &["vg", "vgs", "gate voltage", "gate_voltage", "v_g"]),
    ("Vsd", &["vsd", "vds", "drain voltage", "drain_voltage", "v_ds"]),
    ("I", &["i", "id", "ids", "current", "drain current", "i_ds"]),
    ("t", &["t", "time", "t_s", "elapsed"]),
    ("VL", &["vl", "laser voltage", "v_laser"]),
    ("wl", &["wl", "wavelength", "lambda"]),
    ("Plaser", &["plaser", "power", "laser power"]),
];

// =============================================================================
// Execution
// =============================================================================

/// Upper bound on the default worker count; the workload is I/O bound
pub const MAX_DEFAULT_WORKERS: usize = 8;

/// Dataset name used when none is configured
pub const DEFAULT_DATASET: &str = "raw_measurements";

/// Directory names never descended into during discovery
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".ipynb_checkpoints",
    ".venv",
    "node_modules",
    MANIFEST_DIR_NAME,
];

/// File name patterns eligible for staging
pub const DEFAULT_FILE_PATTERNS: &[&str] = &["*.csv"];

/// Metadata fields denormalised into the manifest by default
pub const DEFAULT_MANIFEST_FIELDS: &[&str] = &[
    "Chip group name",
    "Chip number",
    "Sample",
    "VDS",
    "VG",
    "Laser wavelength",
    "Laser voltage",
    "Information",
];
