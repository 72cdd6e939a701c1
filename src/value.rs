//! Values flowing between steps
//!
//! - `StepValue`: what a binding resolves to and what a step returns
//! - `ChunkStream`: lazy, single-pass sequence of table chunks (stream mode)
//! - `StepArgs`: resolved call arguments handed to a step
//! - `StepOutput`: a step result split into artifacts and metrics

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::TraktError;
use crate::table::Table;

/// Free-form string-keyed metadata / metrics / attributes
pub type Metadata = IndexMap<String, Value>;

/// Reserved result key carrying step metrics
pub const METRICS_KEY: &str = "__metrics__";

// ============================================================================
// CHUNK STREAM
// ============================================================================

type ChunkIter = Box<dyn Iterator<Item = Result<Table, TraktError>> + Send>;

/// Lazy sequence of table chunks. Single-pass: consuming it moves it.
pub struct ChunkStream {
    inner: ChunkIter,
}

impl ChunkStream {
    pub fn new<I>(iter: I) -> Self
    where
        I: Iterator<Item = Result<Table, TraktError>> + Send + 'static,
    {
        Self {
            inner: Box::new(iter),
        }
    }

    pub fn from_tables(tables: Vec<Table>) -> Self {
        Self::new(tables.into_iter().map(Ok))
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    /// Transform every chunk lazily
    pub fn map_chunks<F>(self, mut f: F) -> Self
    where
        F: FnMut(Table) -> Result<Table, TraktError> + Send + 'static,
    {
        Self::new(self.inner.map(move |chunk| chunk.and_then(&mut f)))
    }

    /// Rewrite errors as they surface (used to attribute them to a step)
    pub fn map_errors<F>(self, mut f: F) -> Self
    where
        F: FnMut(TraktError) -> TraktError + Send + 'static,
    {
        Self::new(self.inner.map(move |chunk| chunk.map_err(&mut f)))
    }

    /// Drain the stream into one table. Chunks must share columns.
    pub fn collect_table(self) -> Result<Table, TraktError> {
        let mut merged: Option<Table> = None;
        for chunk in self {
            let chunk = chunk?;
            match merged.as_mut() {
                None => merged = Some(chunk),
                Some(table) => table.append(chunk)?,
            }
        }
        Ok(merged.unwrap_or_default())
    }
}

impl Iterator for ChunkStream {
    type Item = Result<Table, TraktError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChunkStream(..)")
    }
}

// ============================================================================
// STEP VALUE
// ============================================================================

/// A resolved binding or a step result
#[derive(Debug)]
pub enum StepValue {
    Table(Arc<Table>),
    Stream(ChunkStream),
    Literal(Value),
    List(Vec<StepValue>),
    Map(IndexMap<String, StepValue>),
}

impl StepValue {
    /// Build a mapping result, e.g. `StepValue::mapping([("output", table.into())])`
    pub fn mapping<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, StepValue)>,
        K: Into<String>,
    {
        StepValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StepValue::Table(_) => "table",
            StepValue::Stream(_) => "stream",
            StepValue::Literal(_) => "literal",
            StepValue::List(_) => "list",
            StepValue::Map(_) => "mapping",
        }
    }

    /// Row count, summed over nested lists/mappings. Streams and literals have none.
    pub fn row_count(&self) -> Option<u64> {
        match self {
            StepValue::Table(t) => Some(t.num_rows() as u64),
            StepValue::Stream(_) | StepValue::Literal(_) => None,
            StepValue::List(items) => sum_counts(items.iter()),
            StepValue::Map(map) => sum_counts(map.values()),
        }
    }

    /// Rebuild the value with every nested stream passed through `f`
    pub fn map_streams(self, f: &mut dyn FnMut(ChunkStream) -> ChunkStream) -> StepValue {
        match self {
            StepValue::Stream(s) => StepValue::Stream(f(s)),
            StepValue::List(items) => {
                StepValue::List(items.into_iter().map(|v| v.map_streams(f)).collect())
            }
            StepValue::Map(map) => StepValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, v.map_streams(f)))
                    .collect(),
            ),
            other => other,
        }
    }

    pub fn contains_stream(&self) -> bool {
        match self {
            StepValue::Stream(_) => true,
            StepValue::List(items) => items.iter().any(StepValue::contains_stream),
            StepValue::Map(map) => map.values().any(StepValue::contains_stream),
            _ => false,
        }
    }

    /// Cheap copy of a non-stream value; `None` for anything holding a stream
    pub fn try_share(&self) -> Option<StepValue> {
        match self {
            StepValue::Table(t) => Some(StepValue::Table(Arc::clone(t))),
            StepValue::Stream(_) => None,
            StepValue::Literal(v) => Some(StepValue::Literal(v.clone())),
            StepValue::List(items) => items
                .iter()
                .map(StepValue::try_share)
                .collect::<Option<Vec<_>>>()
                .map(StepValue::List),
            StepValue::Map(map) => map
                .iter()
                .map(|(k, v)| v.try_share().map(|v| (k.clone(), v)))
                .collect::<Option<IndexMap<_, _>>>()
                .map(StepValue::Map),
        }
    }

    pub fn as_table(&self) -> Option<&Arc<Table>> {
        match self {
            StepValue::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            StepValue::Literal(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_table(self) -> Result<Arc<Table>, TraktError> {
        match self {
            StepValue::Table(t) => Ok(t),
            other => Err(TraktError::contract(format!(
                "expected a table, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn into_stream(self) -> Result<ChunkStream, TraktError> {
        match self {
            StepValue::Stream(s) => Ok(s),
            other => Err(TraktError::contract(format!(
                "expected a stream, got {}",
                other.type_name()
            ))),
        }
    }
}

fn sum_counts<'a>(values: impl Iterator<Item = &'a StepValue>) -> Option<u64> {
    let mut total = None;
    for value in values {
        if let Some(n) = value.row_count() {
            total = Some(total.unwrap_or(0) + n);
        }
    }
    total
}

impl From<Table> for StepValue {
    fn from(table: Table) -> Self {
        StepValue::Table(Arc::new(table))
    }
}

impl From<Arc<Table>> for StepValue {
    fn from(table: Arc<Table>) -> Self {
        StepValue::Table(table)
    }
}

impl From<ChunkStream> for StepValue {
    fn from(stream: ChunkStream) -> Self {
        StepValue::Stream(stream)
    }
}

impl From<Value> for StepValue {
    fn from(value: Value) -> Self {
        StepValue::Literal(value)
    }
}

// ============================================================================
// STEP ARGS
// ============================================================================

/// Resolved call arguments, keyed by parameter name
#[derive(Debug, Default)]
pub struct StepArgs {
    values: IndexMap<String, StepValue>,
}

impl StepArgs {
    pub fn new(values: IndexMap<String, StepValue>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: StepValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&StepValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Move an argument out
    pub fn take(&mut self, name: &str) -> Result<StepValue, TraktError> {
        self.values
            .shift_remove(name)
            .ok_or_else(|| TraktError::MissingArgument {
                name: name.to_string(),
            })
    }

    pub fn table(&mut self, name: &str) -> Result<Arc<Table>, TraktError> {
        self.take(name)?.into_table()
    }

    pub fn stream(&mut self, name: &str) -> Result<ChunkStream, TraktError> {
        self.take(name)?.into_stream()
    }

    pub fn literal(&self, name: &str) -> Result<&Value, TraktError> {
        match self.values.get(name) {
            Some(StepValue::Literal(v)) => Ok(v),
            Some(other) => Err(TraktError::contract(format!(
                "argument '{name}' must be a literal, got {}",
                other.type_name()
            ))),
            None => Err(TraktError::MissingArgument {
                name: name.to_string(),
            }),
        }
    }

    /// Sum of row counts across table arguments
    pub fn row_count(&self) -> Option<u64> {
        sum_counts(self.values.values())
    }

    pub fn into_inner(self) -> IndexMap<String, StepValue> {
        self.values
    }
}

impl<K: Into<String>> FromIterator<(K, StepValue)> for StepArgs {
    fn from_iter<T: IntoIterator<Item = (K, StepValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

// ============================================================================
// STEP OUTPUT
// ============================================================================

/// A step result split into named values and metrics
#[derive(Debug, Default)]
pub struct StepOutput {
    pub values: IndexMap<String, StepValue>,
    pub metrics: Metadata,
}

impl StepOutput {
    /// Validate the result shape: a mapping, with `__metrics__` (if present) a mapping
    pub fn from_value(value: StepValue) -> Result<Self, TraktError> {
        let mut values = match value {
            StepValue::Map(map) => map,
            other => {
                return Err(TraktError::contract(format!(
                    "step must return a mapping of output values, got {}",
                    other.type_name()
                )))
            }
        };
        let metrics = match values.shift_remove(METRICS_KEY) {
            None => Metadata::new(),
            Some(raw) => metrics_from_value(raw)?,
        };
        Ok(Self { values, metrics })
    }
}

fn metrics_from_value(raw: StepValue) -> Result<Metadata, TraktError> {
    match raw {
        StepValue::Literal(Value::Object(map)) => Ok(map.into_iter().collect()),
        StepValue::Map(map) => map
            .into_iter()
            .map(|(k, v)| match v {
                StepValue::Literal(v) => Ok((k, v)),
                other => Err(TraktError::contract(format!(
                    "metric '{k}' must be a literal, got {}",
                    other.type_name()
                ))),
            })
            .collect(),
        other => Err(TraktError::contract(format!(
            "{METRICS_KEY} must be a mapping, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Cell;
    use serde_json::json;

    fn table(rows: i64) -> Table {
        Table::from_rows(["n"], (0..rows).map(|i| vec![Cell::Int(i)]).collect()).unwrap()
    }

    #[test]
    fn test_row_count_sums_nested_values() {
        let value = StepValue::mapping([
            ("a", table(2).into()),
            (
                "b",
                StepValue::List(vec![table(3).into(), json!("label").into()]),
            ),
        ]);
        assert_eq!(value.row_count(), Some(5));
        assert_eq!(StepValue::Literal(json!(1)).row_count(), None);
    }

    #[test]
    fn test_try_share_refuses_streams() {
        let shared = StepValue::from(table(1)).try_share();
        assert!(matches!(shared, Some(StepValue::Table(_))));
        let nested = StepValue::List(vec![ChunkStream::empty().into()]);
        assert!(nested.try_share().is_none());
        assert!(nested.contains_stream());
    }

    #[test]
    fn test_collect_table_concatenates_chunks() {
        let stream = ChunkStream::from_tables(vec![table(2), table(1)]);
        assert_eq!(stream.collect_table().unwrap().num_rows(), 3);
    }

    #[test]
    fn test_step_output_extracts_metrics() {
        let value = StepValue::mapping([
            ("output", table(1).into()),
            (METRICS_KEY, json!({"rows_dropped": 2}).into()),
        ]);
        let output = StepOutput::from_value(value).unwrap();
        assert_eq!(output.values.len(), 1);
        assert_eq!(output.metrics["rows_dropped"], json!(2));
    }

    #[test]
    fn test_step_output_rejects_non_mapping() {
        let err = StepOutput::from_value(table(1).into()).unwrap_err();
        assert!(err.to_string().contains("mapping"));

        let bad_metrics = StepValue::mapping([(METRICS_KEY, json!([1, 2]).into())]);
        assert!(StepOutput::from_value(bad_metrics).is_err());
    }

    #[test]
    fn test_args_accessors() {
        let mut args: StepArgs = [
            ("input", StepValue::from(table(2))),
            ("factor", json!(3).into()),
        ]
        .into_iter()
        .collect();
        assert_eq!(args.literal("factor").unwrap(), &json!(3));
        assert!(args.literal("input").is_err());
        assert_eq!(args.table("input").unwrap().num_rows(), 2);
        assert!(matches!(
            args.take("input"),
            Err(TraktError::MissingArgument { .. })
        ));
    }
}
