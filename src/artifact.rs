//! Artifact declarations: pipeline inputs, outputs and their schemas

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TraktError;
use crate::table::{DataType, Table};
use crate::value::Metadata;

/// Default adapter kind for inputs and outputs
pub const DEFAULT_KIND: &str = "csv";

/// Batch or stream execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Batch,
    Stream,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Batch => "batch",
            ExecutionMode::Stream => "stream",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(ExecutionMode::Batch),
            "stream" => Ok(ExecutionMode::Stream),
            other => Err(other.to_string()),
        }
    }
}

/// How multiple files of one input merge into a single value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineStrategy {
    #[default]
    Concat,
    UnionByName,
    ValidateSchema,
}

impl CombineStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CombineStrategy::Concat => "concat",
            CombineStrategy::UnionByName => "union_by_name",
            CombineStrategy::ValidateSchema => "validate_schema",
        }
    }
}

impl fmt::Display for CombineStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CombineStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concat" => Ok(CombineStrategy::Concat),
            "union_by_name" => Ok(CombineStrategy::UnionByName),
            "validate_schema" => Ok(CombineStrategy::ValidateSchema),
            other => Err(format!(
                "unknown combine_strategy '{other}' (expected concat, union_by_name or validate_schema)"
            )),
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Declared shape of an input artifact
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArtifactSchema {
    /// Exact ordered column list
    pub columns: Option<Vec<String>>,
    /// Expected dtype per column
    pub dtypes: Vec<(String, DataType)>,
}

impl ArtifactSchema {
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: Some(columns.into_iter().map(Into::into).collect()),
            dtypes: Vec::new(),
        }
    }

    pub fn with_dtype(mut self, column: impl Into<String>, dtype: DataType) -> Self {
        self.dtypes.push((column.into(), dtype));
        self
    }

    /// Accepts a column list, a column -> dtype mapping, or `{columns, dtypes}`
    pub fn from_value(raw: &Value) -> Result<Self, String> {
        match raw {
            Value::Array(_) => Ok(Self {
                columns: Some(parse_columns(raw)?),
                dtypes: Vec::new(),
            }),
            Value::Object(map) if map.contains_key("columns") || map.contains_key("dtypes") => {
                let columns = map.get("columns").map(parse_columns).transpose()?;
                let dtypes = match map.get("dtypes") {
                    Some(raw) => parse_dtypes(raw)?,
                    None => Vec::new(),
                };
                Ok(Self { columns, dtypes })
            }
            Value::Object(_) => Ok(Self {
                columns: None,
                dtypes: parse_dtypes(raw)?,
            }),
            _ => Err("schema must be a list of columns or a mapping".to_string()),
        }
    }

    /// Check a loaded table against the declaration
    pub fn validate(&self, table: &Table, artifact: &str, file: &str) -> Result<(), TraktError> {
        self.validate_columns(table.columns(), artifact, file)?;
        for (column, expected) in &self.dtypes {
            let actual = table.dtype(column).ok_or_else(|| TraktError::SchemaMismatch {
                artifact: artifact.to_string(),
                file: file.to_string(),
                details: format!("missing column '{column}'"),
            })?;
            if !dtype_matches(*expected, actual) {
                return Err(TraktError::SchemaMismatch {
                    artifact: artifact.to_string(),
                    file: file.to_string(),
                    details: format!("column '{column}' has dtype {actual}, expected {expected}"),
                });
            }
        }
        Ok(())
    }

    pub fn validate_columns(
        &self,
        columns: &[String],
        artifact: &str,
        file: &str,
    ) -> Result<(), TraktError> {
        match &self.columns {
            Some(expected) if expected.as_slice() != columns => Err(TraktError::SchemaMismatch {
                artifact: artifact.to_string(),
                file: file.to_string(),
                details: format!("columns {columns:?} do not match declared {expected:?}"),
            }),
            _ => Ok(()),
        }
    }
}

/// An all-null column carries no type information and matches anything.
/// Declared floats accept integer data.
fn dtype_matches(expected: DataType, actual: DataType) -> bool {
    actual == DataType::Null
        || expected == actual
        || (expected == DataType::Float && actual == DataType::Int)
}

fn parse_columns(raw: &Value) -> Result<Vec<String>, String> {
    raw.as_array()
        .ok_or_else(|| "schema columns must be a list".to_string())?
        .iter()
        .map(|c| {
            c.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("schema column {c} must be a string"))
        })
        .collect()
}

fn parse_dtypes(raw: &Value) -> Result<Vec<(String, DataType)>, String> {
    let map = raw
        .as_object()
        .ok_or_else(|| "schema dtypes must be a mapping".to_string())?;
    map.iter()
        .map(|(column, dtype)| {
            let name = dtype
                .as_str()
                .ok_or_else(|| format!("dtype for '{column}' must be a string"))?;
            DataType::from_name(name)
                .map(|d| (column.clone(), d))
                .ok_or_else(|| format!("unknown dtype '{name}' for column '{column}'"))
        })
        .collect()
}

// ============================================================================
// INPUT / OUTPUT SPECS
// ============================================================================

/// A declared pipeline input
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSpec {
    pub name: String,
    pub kind: String,
    pub uri: String,
    pub combine_strategy: CombineStrategy,
    pub schema: Option<ArtifactSchema>,
    pub metadata: Metadata,
    pub optional: bool,
}

impl ArtifactSpec {
    /// New input of the default kind, read from `uri`
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DEFAULT_KIND.to_string(),
            uri: uri.into(),
            combine_strategy: CombineStrategy::default(),
            schema: None,
            metadata: Metadata::new(),
            optional: false,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn combine(mut self, strategy: CombineStrategy) -> Self {
        self.combine_strategy = strategy;
        self
    }

    pub fn schema(mut self, schema: ArtifactSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A declared pipeline output
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    /// Artifact to persist
    pub source: String,
    /// Adapter kind; runner default when unset
    pub kind: Option<String>,
    /// Target path; `<output_dir>/<name><ext>` when unset
    pub uri: Option<String>,
    pub metadata: Metadata,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            kind: None,
            uri: None,
            metadata: Metadata::new(),
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Cell;
    use serde_json::json;

    fn table() -> Table {
        Table::from_rows(
            ["id", "amount"],
            vec![vec![Cell::Int(1), Cell::Float(1.5)], vec![Cell::Int(2), Cell::Null]],
        )
        .unwrap()
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!(" Stream ".parse::<ExecutionMode>(), Ok(ExecutionMode::Stream));
        assert_eq!("micro".parse::<ExecutionMode>(), Err("micro".to_string()));
    }

    #[test]
    fn test_combine_strategy_parse() {
        assert_eq!(
            "union_by_name".parse::<CombineStrategy>(),
            Ok(CombineStrategy::UnionByName)
        );
        assert!("zip".parse::<CombineStrategy>().is_err());
    }

    #[test]
    fn test_schema_forms() {
        let list = ArtifactSchema::from_value(&json!(["id", "amount"])).unwrap();
        assert_eq!(list.columns.as_deref().map(|c| c.len()), Some(2));

        let dtypes = ArtifactSchema::from_value(&json!({"id": "int64"})).unwrap();
        assert!(dtypes.columns.is_none());
        assert_eq!(dtypes.dtypes, vec![("id".to_string(), DataType::Int)]);

        let both =
            ArtifactSchema::from_value(&json!({"columns": ["id"], "dtypes": {"id": "int"}}))
                .unwrap();
        assert!(both.columns.is_some() && both.dtypes.len() == 1);

        assert!(ArtifactSchema::from_value(&json!({"id": "decimal"})).is_err());
        assert!(ArtifactSchema::from_value(&json!("id")).is_err());
    }

    #[test]
    fn test_schema_validation() {
        let ok = ArtifactSchema::columns(["id", "amount"]).with_dtype("amount", DataType::Float);
        assert!(ok.validate(&table(), "orders", "a.csv").is_ok());

        let wrong_order = ArtifactSchema::columns(["amount", "id"]);
        let err = wrong_order.validate(&table(), "orders", "a.csv").unwrap_err();
        assert!(matches!(err, TraktError::SchemaMismatch { ref file, .. } if file == "a.csv"));

        let wrong_type = ArtifactSchema::default().with_dtype("id", DataType::String);
        assert!(wrong_type.validate(&table(), "orders", "a.csv").is_err());
    }
}
