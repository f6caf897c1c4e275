//! Declarative per-procedure schema and its shared cache.
//!
//! The schema file maps procedure short names to expected types for header
//! `Parameters`/`Metadata` fields and for `Data` columns. It is optional:
//! a missing or invalid file degrades the pipeline to heuristic typing.

use crate::error::{Result, StagerError};
use crate::models::HeaderSection;
use polars::prelude::{DataType, TimeUnit};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Semantic type a schema may declare for a field or column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    Int,
    Float,
    Bool,
    Datetime,
    Str,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }

    /// Output dtype used for broadcast columns and schema pinning
    pub fn dtype(&self) -> DataType {
        match self {
            FieldType::Int => DataType::Int64,
            FieldType::Float => DataType::Float64,
            FieldType::Bool => DataType::Boolean,
            FieldType::Datetime => DataType::Datetime(TimeUnit::Microseconds, None),
            FieldType::Str => DataType::String,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Datetime => "datetime",
            FieldType::Str => "str",
        }
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" | "int64" => Ok(FieldType::Int),
            "float" | "float64" | "double" => Ok(FieldType::Float),
            "bool" | "boolean" => Ok(FieldType::Bool),
            "datetime" | "timestamp" => Ok(FieldType::Datetime),
            "str" | "string" | "text" => Ok(FieldType::Str),
            other => Err(format!("unknown field type '{other}'")),
        }
    }
}

impl TryFrom<String> for FieldType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected types for one procedure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureSchema {
    #[serde(rename = "Parameters", default, deserialize_with = "null_as_empty")]
    pub parameters: BTreeMap<String, FieldType>,

    #[serde(rename = "Metadata", default, deserialize_with = "null_as_empty")]
    pub metadata: BTreeMap<String, FieldType>,

    #[serde(rename = "Data", default, deserialize_with = "null_as_empty")]
    pub data: BTreeMap<String, FieldType>,
}

impl ProcedureSchema {
    /// Declared type of a header field; exact key first, then case-insensitive
    pub fn field_type(&self, section: HeaderSection, key: &str) -> Option<FieldType> {
        let fields = match section {
            HeaderSection::Parameters => &self.parameters,
            HeaderSection::Metadata => &self.metadata,
        };
        lookup(fields, key)
    }

    pub fn data_type(&self, column: &str) -> Option<FieldType> {
        lookup(&self.data, column)
    }
}

fn lookup(fields: &BTreeMap<String, FieldType>, key: &str) -> Option<FieldType> {
    fields.get(key).copied().or_else(|| {
        let key = key.trim();
        fields
            .iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
            .map(|(_, t)| *t)
    })
}

fn null_as_empty<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, FieldType>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, FieldType>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parsed schema file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureSchemas {
    #[serde(default)]
    pub version: Option<u32>,

    #[serde(default)]
    pub procedures: BTreeMap<String, ProcedureSchema>,
}

impl ProcedureSchemas {
    /// Read and parse a YAML schema file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| StagerError::SchemaConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&yaml).map_err(|reason| StagerError::SchemaConfig {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| e.to_string())
    }

    /// Load a schema, degrading to an empty one (pure heuristics) on any failure
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            debug!("No procedure schema configured; using heuristic typing");
            return Self::default();
        };

        if !path.exists() {
            warn!(
                "Procedure schema not found at {}; using heuristic typing",
                path.display()
            );
            return Self::default();
        }

        match Self::load(path) {
            Ok(schemas) => {
                debug!(
                    "Loaded procedure schema for {} procedures from {}",
                    schemas.procedures.len(),
                    path.display()
                );
                schemas
            }
            Err(e) => {
                warn!("{}; using heuristic typing", e);
                Self::default()
            }
        }
    }

    /// Schema entry for a procedure short name; exact first, then case-insensitive
    pub fn get(&self, proc: &str) -> Option<&ProcedureSchema> {
        self.procedures.get(proc).or_else(|| {
            self.procedures
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(proc))
                .map(|(_, schema)| schema)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

/// Read-only schema shared by all workers.
///
/// The file is parsed on first access; `OnceLock` serialises that first
/// initialisation and every later access sees the same immutable value.
#[derive(Debug, Default)]
pub struct ProcedureSchemaCache {
    path: Option<PathBuf>,
    schemas: OnceLock<ProcedureSchemas>,
}

impl ProcedureSchemaCache {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            schemas: OnceLock::new(),
        }
    }

    /// Cache pre-populated with already-parsed schemas
    pub fn from_schemas(schemas: ProcedureSchemas) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(schemas);
        Self {
            path: None,
            schemas: cell,
        }
    }

    pub fn get(&self) -> &ProcedureSchemas {
        self.schemas
            .get_or_init(|| ProcedureSchemas::load_or_default(self.path.as_deref()))
    }

    pub fn procedure(&self, proc: &str) -> Option<&ProcedureSchema> {
        self.get().get(proc)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
