//! Built-in quality gate step
//!
//! Applies a declarative policy to a dataset and passes the data through
//! unchanged. Checks run in a fixed order:
//! 1. required columns
//! 2. row count bounds
//! 3. uniqueness, per declared key
//! 4. null ratio, per column
//!
//! In `warn` mode each violation becomes a `warning.quality_gate` event. In
//! `fail` mode the first violation aborts the run. `gate_modes` overrides the
//! mode per check.
//!
//! Stream inputs are checked chunk by chunk: `row_count.max` fails as soon as
//! it is exceeded, everything else is decided when the stream is exhausted.

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::binding::BindingNode;
use crate::context::RunContext;
use crate::error::TraktError;
use crate::event_log::names;
use crate::step::Step;
use crate::table::Table;
use crate::value::{ChunkStream, Metadata, StepArgs, StepValue, METRICS_KEY};

// ============================================================================
// POLICY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GateMode {
    #[default]
    Fail,
    Warn,
}

impl TryFrom<String> for GateMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(GateMode::Fail),
            "warn" => Ok(GateMode::Warn),
            _ => Err(format!("unsupported quality gate mode '{value}'")),
        }
    }
}

impl From<GateMode> for String {
    fn from(mode: GateMode) -> Self {
        match mode {
            GateMode::Fail => "fail".to_string(),
            GateMode::Warn => "warn".to_string(),
        }
    }
}

/// Check categories, usable as `gate_modes` keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateCheck {
    RequiredColumns,
    RowCount,
    UniqueKeys,
    MaxNullRatio,
}

impl GateCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateCheck::RequiredColumns => "required_columns",
            GateCheck::RowCount => "row_count",
            GateCheck::UniqueKeys => "unique_keys",
            GateCheck::MaxNullRatio => "max_null_ratio",
        }
    }
}

impl fmt::Display for GateCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unique key: a column or a composite of columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UniqueKey {
    Column(String),
    Composite(Vec<String>),
}

impl UniqueKey {
    pub fn columns(&self) -> Vec<String> {
        match self {
            UniqueKey::Column(c) => vec![c.clone()],
            UniqueKey::Composite(cs) => cs.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowCountBounds {
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityGatePolicy {
    #[serde(default)]
    pub mode: GateMode,
    #[serde(default)]
    pub required_columns: Vec<String>,
    #[serde(default)]
    pub unique_keys: Vec<UniqueKey>,
    #[serde(default)]
    pub row_count: Option<RowCountBounds>,
    #[serde(default)]
    pub max_null_ratio: IndexMap<String, f64>,
    #[serde(default)]
    pub gate_modes: IndexMap<GateCheck, GateMode>,
}

impl QualityGatePolicy {
    /// Parse and validate a policy literal
    pub fn from_value(raw: &Value) -> Result<Self, String> {
        let policy: QualityGatePolicy = serde_json::from_value(raw.clone())
            .map_err(|e| format!("invalid quality gate policy: {e}"))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(bounds) = &self.row_count {
            if bounds.min.is_some_and(|m| m < 0) {
                return Err("row_count min must be >= 0".to_string());
            }
            if bounds.max.is_some_and(|m| m < 0) {
                return Err("row_count max must be >= 0".to_string());
            }
            if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
                if min > max {
                    return Err("row_count min cannot exceed max".to_string());
                }
            }
        }
        for (column, threshold) in &self.max_null_ratio {
            if !(0.0..=1.0).contains(threshold) {
                return Err(format!(
                    "max_null_ratio for '{column}' must be between 0 and 1"
                ));
            }
        }
        Ok(())
    }

    pub fn mode_for(&self, check: GateCheck) -> GateMode {
        self.gate_modes.get(&check).copied().unwrap_or(self.mode)
    }

    fn row_bounds(&self) -> (Option<u64>, Option<u64>) {
        match &self.row_count {
            Some(b) => (
                b.min.map(|m| m.max(0) as u64),
                b.max.map(|m| m.max(0) as u64),
            ),
            None => (None, None),
        }
    }

    /// Number of checks this policy performs
    pub fn check_count(&self) -> u64 {
        let (min, max) = self.row_bounds();
        let mut count = 0;
        if !self.required_columns.is_empty() {
            count += 1;
        }
        if min.is_some() || max.is_some() {
            count += 1;
        }
        count + self.unique_keys.len() as u64 + self.max_null_ratio.len() as u64
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

/// One failed check
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub check: GateCheck,
    pub message: String,
    pub details: serde_json::Map<String, Value>,
}

impl Violation {
    fn new(check: GateCheck, message: String, details: Value) -> Self {
        let details = match details {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            check,
            message,
            details,
        }
    }

    /// Event / error payload: details plus gate name and message
    pub fn payload(&self) -> Value {
        let mut payload = self.details.clone();
        payload.insert("gate".into(), Value::String(self.check.to_string()));
        payload.insert("message".into(), Value::String(self.message.clone()));
        Value::Object(payload)
    }

    fn into_error(self) -> TraktError {
        let details = self.payload();
        TraktError::QualityViolation {
            gate: self.check.to_string(),
            message: self.message,
            details,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateMetrics {
    pub checks: u64,
    pub violations: u64,
    pub warnings: u64,
}

impl GateMetrics {
    pub fn to_metadata(&self) -> Metadata {
        let mut metrics = Metadata::new();
        metrics.insert("quality_checks".into(), json!(self.checks));
        metrics.insert("quality_violations".into(), json!(self.violations));
        metrics.insert("quality_warnings".into(), json!(self.warnings));
        metrics
    }
}

/// Statistics accumulated over one or many chunks
#[derive(Debug)]
struct GateStats {
    columns: Option<Vec<String>>,
    rows: u64,
    /// per unique key: seen key tuples, duplicate count
    keys: Vec<(HashSet<String>, u64)>,
    nulls: IndexMap<String, u64>,
}

impl GateStats {
    fn new(policy: &QualityGatePolicy) -> Self {
        Self {
            columns: None,
            rows: 0,
            keys: policy
                .unique_keys
                .iter()
                .map(|_| (HashSet::new(), 0))
                .collect(),
            nulls: policy
                .max_null_ratio
                .keys()
                .map(|c| (c.clone(), 0))
                .collect(),
        }
    }

    fn observe(&mut self, table: &Table, policy: &QualityGatePolicy) {
        if self.columns.is_none() {
            self.columns = Some(table.columns().to_vec());
        }
        self.rows += table.num_rows() as u64;

        for (key, (seen, duplicates)) in policy.unique_keys.iter().zip(self.keys.iter_mut()) {
            let indices: Option<Vec<usize>> = key
                .columns()
                .iter()
                .map(|c| table.column_index(c))
                .collect();
            let Some(indices) = indices else { continue };
            for row in table.rows() {
                let tuple = indices
                    .iter()
                    .map(|&i| format!("{:?}", row[i]))
                    .collect::<Vec<_>>()
                    .join("\u{1f}");
                if !seen.insert(tuple) {
                    *duplicates += 1;
                }
            }
        }

        for (column, count) in self.nulls.iter_mut() {
            if let Some(cells) = table.column(column) {
                *count += cells.filter(|c| c.is_null()).count() as u64;
            }
        }
    }

    fn has_column(&self, column: &str) -> bool {
        match &self.columns {
            Some(columns) => columns.iter().any(|c| c == column),
            // nothing observed: no data to contradict the policy
            None => true,
        }
    }

    fn max_exceeded(&self, policy: &QualityGatePolicy) -> Option<Violation> {
        let (_, max) = policy.row_bounds();
        let max = max?;
        (self.rows > max).then(|| {
            Violation::new(
                GateCheck::RowCount,
                format!("Row count {} exceeds maximum {max}.", self.rows),
                json!({"row_count": self.rows, "max": max}),
            )
        })
    }

    /// All violations, in evaluation order
    fn violations(&self, policy: &QualityGatePolicy) -> Vec<Violation> {
        let mut out = Vec::new();

        if !policy.required_columns.is_empty() {
            let mut missing: Vec<String> = policy
                .required_columns
                .iter()
                .filter(|c| !self.has_column(c))
                .cloned()
                .collect();
            missing.sort();
            missing.dedup();
            if !missing.is_empty() {
                out.push(Violation::new(
                    GateCheck::RequiredColumns,
                    format!("Missing required columns: {missing:?}."),
                    json!({ "columns": missing }),
                ));
            }
        }

        let (min, _) = policy.row_bounds();
        if let Some(min) = min {
            if self.rows < min {
                out.push(Violation::new(
                    GateCheck::RowCount,
                    format!("Row count {} is below minimum {min}.", self.rows),
                    json!({"row_count": self.rows, "min": min}),
                ));
            }
        }
        out.extend(self.max_exceeded(policy));

        for (key, (_, duplicates)) in policy.unique_keys.iter().zip(&self.keys) {
            let columns = key.columns();
            let mut missing: Vec<&String> = columns.iter().filter(|c| !self.has_column(c)).collect();
            missing.sort();
            if !missing.is_empty() {
                out.push(Violation::new(
                    GateCheck::UniqueKeys,
                    format!("Unique key columns missing: {missing:?}."),
                    json!({"keys": columns, "missing_columns": missing}),
                ));
            } else if *duplicates > 0 {
                out.push(Violation::new(
                    GateCheck::UniqueKeys,
                    format!("Found {duplicates} duplicate rows for unique keys {columns:?}."),
                    json!({"keys": columns, "duplicate_rows": duplicates}),
                ));
            }
        }

        for (column, threshold) in &policy.max_null_ratio {
            if !self.has_column(column) {
                out.push(Violation::new(
                    GateCheck::MaxNullRatio,
                    format!("Null ratio column is missing: {column}."),
                    json!({"column": column, "max_null_ratio": threshold}),
                ));
                continue;
            }
            if self.rows == 0 {
                continue;
            }
            let nulls = self.nulls.get(column).copied().unwrap_or(0);
            let ratio = nulls as f64 / self.rows as f64;
            if ratio > *threshold {
                out.push(Violation::new(
                    GateCheck::MaxNullRatio,
                    format!(
                        "Column '{column}' null ratio {ratio:.4} exceeds threshold {threshold:.4}."
                    ),
                    json!({"column": column, "null_ratio": ratio, "max_null_ratio": threshold}),
                ));
            }
        }

        out
    }
}

/// Apply violations in order: warn-mode ones become events, the first
/// fail-mode one aborts.
fn enforce(
    violations: Vec<Violation>,
    policy: &QualityGatePolicy,
    ctx: &RunContext,
    step_id: Option<&str>,
    metrics: &mut GateMetrics,
) -> Result<(), TraktError> {
    for violation in violations {
        metrics.violations += 1;
        match policy.mode_for(violation.check) {
            GateMode::Warn => {
                metrics.warnings += 1;
                ctx.emit_step_event(step_id, names::QUALITY_GATE_WARNING, violation.payload());
            }
            GateMode::Fail => return Err(violation.into_error()),
        }
    }
    Ok(())
}

/// Evaluate a whole table
pub fn evaluate_table(
    table: &Table,
    policy: &QualityGatePolicy,
    ctx: &RunContext,
) -> Result<GateMetrics, TraktError> {
    let mut stats = GateStats::new(policy);
    stats.observe(table, policy);
    let mut metrics = GateMetrics {
        checks: policy.check_count(),
        ..Default::default()
    };
    let step_id = ctx.active_step();
    enforce(stats.violations(policy), policy, ctx, step_id.as_deref(), &mut metrics)?;
    Ok(metrics)
}

/// Wrap a chunk stream with incremental checks. Metrics are reported to the
/// context once the stream is exhausted.
pub fn gate_stream(stream: ChunkStream, policy: QualityGatePolicy, ctx: &RunContext) -> ChunkStream {
    let stats = GateStats::new(&policy);
    ChunkStream::new(GateStream {
        inner: stream,
        stats,
        policy,
        ctx: ctx.clone(),
        step_id: ctx.active_step(),
        finished: false,
    })
}

struct GateStream {
    inner: ChunkStream,
    stats: GateStats,
    policy: QualityGatePolicy,
    ctx: RunContext,
    step_id: Option<String>,
    finished: bool,
}

impl GateStream {
    fn finish(&mut self) -> Result<(), TraktError> {
        self.finished = true;
        let mut metrics = GateMetrics {
            checks: self.policy.check_count(),
            ..Default::default()
        };
        let result = enforce(
            self.stats.violations(&self.policy),
            &self.policy,
            &self.ctx,
            self.step_id.as_deref(),
            &mut metrics,
        );
        if let Some(step_id) = &self.step_id {
            self.ctx.report_metrics(step_id, metrics.to_metadata());
        }
        result
    }

    fn fail_fast(&mut self) -> Result<(), TraktError> {
        if self.policy.mode_for(GateCheck::RowCount) != GateMode::Fail {
            return Ok(());
        }
        match self.stats.max_exceeded(&self.policy) {
            Some(violation) => {
                self.finished = true;
                if let Some(step_id) = &self.step_id {
                    let metrics = GateMetrics {
                        checks: self.policy.check_count(),
                        violations: 1,
                        warnings: 0,
                    };
                    self.ctx.report_metrics(step_id, metrics.to_metadata());
                }
                Err(violation.into_error())
            }
            None => Ok(()),
        }
    }
}

impl Iterator for GateStream {
    type Item = Result<Table, TraktError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.inner.next() {
            Some(Ok(chunk)) => {
                self.stats.observe(&chunk, &self.policy);
                match self.fail_fast() {
                    Ok(()) => Some(Ok(chunk)),
                    Err(e) => Some(Err(e)),
                }
            }
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => self.finish().err().map(Err),
        }
    }
}

// ============================================================================
// STEP
// ============================================================================

/// The `quality_gate` step: `(input, policy) -> output`
#[derive(Debug, Default)]
pub struct QualityGate;

impl Step for QualityGate {
    fn run(&self, ctx: &RunContext, mut args: StepArgs) -> Result<StepValue, TraktError> {
        let policy = QualityGatePolicy::from_value(args.literal("policy")?).map_err(TraktError::step)?;
        match args.take("input")? {
            StepValue::Table(table) => {
                let metrics = evaluate_table(&table, &policy, ctx)?;
                let metrics: serde_json::Map<String, Value> =
                    metrics.to_metadata().into_iter().collect();
                Ok(StepValue::mapping([
                    ("output", StepValue::Table(table)),
                    (METRICS_KEY, StepValue::Literal(Value::Object(metrics))),
                ]))
            }
            StepValue::Stream(stream) => Ok(StepValue::mapping([(
                "output",
                StepValue::Stream(gate_stream(stream, policy, ctx)),
            )])),
            other => Err(TraktError::contract(format!(
                "quality gate input must be a table or stream, got {}",
                other.type_name()
            ))),
        }
    }

    fn declared_inputs(&self) -> Vec<String> {
        vec!["input".to_string(), "policy".to_string()]
    }

    fn declared_outputs(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn supports_stream(&self) -> bool {
        true
    }

    fn check_bindings(&self, bindings: &IndexMap<String, BindingNode>) -> Result<(), String> {
        match bindings.get("policy") {
            None => Ok(()),
            Some(BindingNode::Literal(raw)) => QualityGatePolicy::from_value(raw).map(|_| ()),
            Some(_) => Err("policy must be a literal ({const: {...}})".to_string()),
        }
    }
}
