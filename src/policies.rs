//! Table policies: join, dedupe, rename
//!
//! Declarative helpers for the transformations most pipelines repeat. Each
//! policy is plain data (usable as a `{const: ...}` literal) and each
//! `apply_*` function works on whole tables. The built-in `join`, `dedupe`
//! and `rename` steps wrap them.
//!
//! Warnings go to the run context as events:
//! - `warning.join_unmatched`: left rows without a match (`unmatched: warn`)
//! - `warning.rename_optional_missing`: optional columns that are absent

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::binding::BindingNode;
use crate::context::RunContext;
use crate::error::TraktError;
use crate::event_log::names;
use crate::step::Step;
use crate::table::{Cell, Table};
use crate::value::{StepArgs, StepValue};

fn emit(ctx: Option<&RunContext>, name: &str, attributes: Value) {
    if let Some(ctx) = ctx {
        ctx.emit_event(name, attributes);
    }
}

fn sorted_missing<'a>(wanted: impl IntoIterator<Item = &'a String>, table: &Table) -> Vec<String> {
    let mut missing: Vec<String> = wanted
        .into_iter()
        .filter(|c| !table.has_column(c))
        .cloned()
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

fn key_of(row: &[Cell], idx: &[usize]) -> String {
    let cells: Vec<&Cell> = idx.iter().map(|&i| &row[i]).collect();
    format!("{cells:?}")
}

fn column_indices(table: &Table, columns: &[String]) -> Vec<usize> {
    columns
        .iter()
        .filter_map(|c| table.column_index(c))
        .collect()
}

fn parse_policy<T: serde::de::DeserializeOwned>(raw: &Value, what: &str) -> Result<T, String> {
    serde_json::from_value(raw.clone()).map_err(|e| format!("invalid {what} policy: {e}"))
}

fn check_literal_policy(
    bindings: &IndexMap<String, BindingNode>,
    parse: impl Fn(&Value) -> Result<(), String>,
) -> Result<(), String> {
    match bindings.get("policy") {
        None => Ok(()),
        Some(BindingNode::Literal(raw)) => parse(raw),
        Some(_) => Err("policy must be a literal ({const: {...}})".to_string()),
    }
}

// ============================================================================
// JOIN
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinHow {
    #[default]
    Left,
    Right,
    Inner,
    Outer,
}

/// What to do with overlapping non-key columns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collision {
    #[default]
    Suffix,
    /// Overlapping columns are an error
    None,
}

/// Handling of left rows without a match on the right
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unmatched {
    #[default]
    Allow,
    Warn,
    /// Keep matched rows only
    Drop,
    Fail,
}

fn default_suffixes() -> (String, String) {
    ("_left".to_string(), "_right".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinPolicy {
    pub keys: Vec<String>,
    #[serde(default)]
    pub how: JoinHow,
    #[serde(default)]
    pub collision: Collision,
    #[serde(default = "default_suffixes")]
    pub suffixes: (String, String),
    #[serde(default)]
    pub unmatched: Unmatched,
}

impl JoinPolicy {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            how: JoinHow::default(),
            collision: Collision::default(),
            suffixes: default_suffixes(),
            unmatched: Unmatched::default(),
        }
    }

    pub fn how(mut self, how: JoinHow) -> Self {
        self.how = how;
        self
    }

    pub fn collision(mut self, collision: Collision) -> Self {
        self.collision = collision;
        self
    }

    pub fn suffixes(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.suffixes = (left.into(), right.into());
        self
    }

    pub fn unmatched(mut self, unmatched: Unmatched) -> Self {
        self.unmatched = unmatched;
        self
    }

    pub fn from_value(raw: &Value) -> Result<Self, String> {
        let policy: JoinPolicy = parse_policy(raw, "join")?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.keys.is_empty() {
            return Err("Join policy requires at least one key column.".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Both,
    LeftOnly,
    RightOnly,
}

/// Join two tables on shared key columns.
///
/// Columns: left columns in order, then right non-key columns. Rows follow
/// the driving side's order (left, or right for `how: right`); an outer join
/// appends unmatched right rows at the end.
pub fn apply_join_policy(
    left: &Table,
    right: &Table,
    policy: &JoinPolicy,
    ctx: Option<&RunContext>,
) -> Result<Table, TraktError> {
    policy
        .validate()
        .map_err(|m| TraktError::policy("join", m))?;

    let missing_left = sorted_missing(&policy.keys, left);
    let missing_right = sorted_missing(&policy.keys, right);
    if !missing_left.is_empty() || !missing_right.is_empty() {
        return Err(TraktError::policy(
            "join",
            format!(
                "Join keys missing from input tables: left={missing_left:?}, right={missing_right:?}."
            ),
        ));
    }

    let left_keys = column_indices(left, &policy.keys);
    let right_keys = column_indices(right, &policy.keys);
    let key_names: HashSet<&str> = policy.keys.iter().map(String::as_str).collect();
    let right_extra: Vec<usize> = (0..right.columns().len())
        .filter(|&i| !key_names.contains(right.columns()[i].as_str()))
        .collect();
    let overlap: HashSet<&str> = right_extra
        .iter()
        .map(|&i| right.columns()[i].as_str())
        .filter(|c| left.has_column(c) && !key_names.contains(c))
        .collect();

    if policy.collision == Collision::None && !overlap.is_empty() {
        let mut cols: Vec<&str> = overlap.iter().copied().collect();
        cols.sort();
        return Err(TraktError::policy(
            "join",
            format!("Columns overlap and collision is 'none': {cols:?}."),
        ));
    }

    let (left_suffix, right_suffix) = &policy.suffixes;
    let mut columns: Vec<String> = left
        .columns()
        .iter()
        .map(|c| match overlap.contains(c.as_str()) {
            true => format!("{c}{left_suffix}"),
            false => c.clone(),
        })
        .collect();
    columns.extend(right_extra.iter().map(|&i| {
        let c = &right.columns()[i];
        match overlap.contains(c.as_str()) {
            true => format!("{c}{right_suffix}"),
            false => c.clone(),
        }
    }));
    let mut seen = HashSet::new();
    let mut duplicated: Vec<&String> = columns.iter().filter(|c| !seen.insert(*c)).collect();
    if !duplicated.is_empty() {
        duplicated.sort();
        return Err(TraktError::policy(
            "join",
            format!("Join produced duplicate columns: {duplicated:?}."),
        ));
    }

    let joined = |l: &[Cell], r: &[Cell]| -> Vec<Cell> {
        l.iter()
            .cloned()
            .chain(right_extra.iter().map(|&i| r[i].clone()))
            .collect()
    };
    let left_nulls = |r: &[Cell]| -> Vec<Cell> {
        let mut row = vec![Cell::Null; left.columns().len()];
        for (&li, &ri) in left_keys.iter().zip(&right_keys) {
            row[li] = r[ri].clone();
        }
        row.extend(right_extra.iter().map(|&i| r[i].clone()));
        row
    };
    let right_nulls = |l: &[Cell]| -> Vec<Cell> {
        l.iter()
            .cloned()
            .chain(right_extra.iter().map(|_| Cell::Null))
            .collect()
    };

    let mut out: Vec<(Side, Vec<Cell>)> = Vec::new();
    match policy.how {
        JoinHow::Right => {
            let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
            for (i, row) in left.rows().iter().enumerate() {
                by_key.entry(key_of(row, &left_keys)).or_default().push(i);
            }
            for r in right.rows() {
                match by_key.get(&key_of(r, &right_keys)) {
                    Some(matches) => {
                        for &i in matches {
                            out.push((Side::Both, joined(&left.rows()[i], r)));
                        }
                    }
                    None => out.push((Side::RightOnly, left_nulls(r))),
                }
            }
        }
        how => {
            let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
            for (i, row) in right.rows().iter().enumerate() {
                by_key.entry(key_of(row, &right_keys)).or_default().push(i);
            }
            let mut matched = vec![false; right.num_rows()];
            for l in left.rows() {
                match by_key.get(&key_of(l, &left_keys)) {
                    Some(matches) => {
                        for &i in matches {
                            matched[i] = true;
                            out.push((Side::Both, joined(l, &right.rows()[i])));
                        }
                    }
                    None if how != JoinHow::Inner => out.push((Side::LeftOnly, right_nulls(l))),
                    None => {}
                }
            }
            if how == JoinHow::Outer {
                for (i, r) in right.rows().iter().enumerate() {
                    if !matched[i] {
                        out.push((Side::RightOnly, left_nulls(r)));
                    }
                }
            }
        }
    }

    let unmatched = out.iter().filter(|(side, _)| *side == Side::LeftOnly).count();
    if unmatched > 0 {
        match policy.unmatched {
            Unmatched::Allow => {}
            Unmatched::Warn => emit(
                ctx,
                names::JOIN_UNMATCHED_WARNING,
                json!({ "unmatched_count": unmatched, "keys": policy.keys }),
            ),
            Unmatched::Drop => out.retain(|(side, _)| *side == Side::Both),
            Unmatched::Fail => {
                return Err(TraktError::policy(
                    "join",
                    format!("Join policy failed due to {unmatched} unmatched rows."),
                ))
            }
        }
    }

    Table::from_rows(columns, out.into_iter().map(|(_, row)| row).collect())
}

// ============================================================================
// DEDUPE
// ============================================================================

/// Which row survives among rows sharing a key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeWinner {
    /// Highest `order_by` value
    #[default]
    Latest,
    /// Lowest `order_by` value
    Earliest,
    Max,
    Min,
    First,
    Last,
    /// Row with the most non-null cells
    NonNull,
}

impl DedupeWinner {
    fn needs_order_by(&self) -> bool {
        matches!(
            self,
            DedupeWinner::Latest | DedupeWinner::Earliest | DedupeWinner::Max | DedupeWinner::Min
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DedupePolicy {
    pub keys: Vec<String>,
    #[serde(default)]
    pub winner: DedupeWinner,
    #[serde(default)]
    pub order_by: Option<String>,
}

impl DedupePolicy {
    pub fn new<I, S>(keys: I, winner: DedupeWinner) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            winner,
            order_by: None,
        }
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    pub fn from_value(raw: &Value) -> Result<Self, String> {
        let policy: DedupePolicy = parse_policy(raw, "dedupe")?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.keys.is_empty() {
            return Err("Dedupe policy requires at least one key column.".to_string());
        }
        if self.winner.needs_order_by() && self.order_by.is_none() {
            return Err("Dedupe policy requires 'order_by' for this winner rule.".to_string());
        }
        Ok(())
    }
}

/// Sort by one column, nulls last in either direction
fn sort_by_column(order: &mut [usize], table: &Table, column: usize, descending: bool) {
    let rows = table.rows();
    order.sort_by(|&a, &b| {
        let (x, y) = (&rows[a][column], &rows[b][column]);
        match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if descending => y.compare(x),
            (false, false) => x.compare(y),
        }
    });
}

/// Keep one row per key. Rows come out in winner order (sorted for the
/// ordering rules, original order for `first`/`last`).
pub fn apply_dedupe_policy(table: &Table, policy: &DedupePolicy) -> Result<Table, TraktError> {
    policy
        .validate()
        .map_err(|m| TraktError::policy("dedupe", m))?;

    let missing = sorted_missing(&policy.keys, table);
    if !missing.is_empty() {
        return Err(TraktError::policy(
            "dedupe",
            format!("Dedupe keys missing from table: {missing:?}."),
        ));
    }
    let keys = column_indices(table, &policy.keys);
    let rows = table.rows();
    let mut order: Vec<usize> = (0..table.num_rows()).collect();

    if policy.winner.needs_order_by() {
        let column = policy.order_by.as_deref().unwrap_or_default();
        let idx = table.column_index(column).ok_or_else(|| {
            TraktError::policy("dedupe", format!("Dedupe order_by column is missing: {column}."))
        })?;
        let descending = matches!(policy.winner, DedupeWinner::Latest | DedupeWinner::Max);
        sort_by_column(&mut order, table, idx, descending);
    }
    match policy.winner {
        DedupeWinner::Last => order.reverse(),
        DedupeWinner::NonNull => {
            let filled = |i: usize| rows[i].iter().filter(|c| !c.is_null()).count();
            order.sort_by_key(|&i| std::cmp::Reverse(filled(i)));
        }
        _ => {}
    }

    let mut seen = HashSet::new();
    let mut kept: Vec<usize> = order
        .into_iter()
        .filter(|&i| seen.insert(key_of(&rows[i], &keys)))
        .collect();
    if policy.winner == DedupeWinner::Last {
        kept.sort_unstable();
    }

    Table::from_rows(
        table.columns().to_vec(),
        kept.into_iter().map(|i| rows[i].clone()).collect(),
    )
}

// ============================================================================
// RENAME
// ============================================================================

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenamePolicy {
    /// old name -> new name; absent source columns are skipped
    pub mapping: IndexMap<String, String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default = "default_true")]
    pub warn_on_missing_optional: bool,
}

impl RenamePolicy {
    pub fn new<I, K, V>(mapping: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            mapping: mapping
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            required: Vec::new(),
            optional: Vec::new(),
            warn_on_missing_optional: true,
        }
    }

    pub fn required<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn warn_on_missing_optional(mut self, warn: bool) -> Self {
        self.warn_on_missing_optional = warn;
        self
    }

    pub fn from_value(raw: &Value) -> Result<Self, String> {
        parse_policy(raw, "rename")
    }
}

/// Rename columns. Required columns must exist (checked before renaming);
/// missing optional columns only warn. Two columns may not end up with the
/// same name.
pub fn apply_rename_policy(
    table: &Table,
    policy: &RenamePolicy,
    ctx: Option<&RunContext>,
) -> Result<Table, TraktError> {
    let required_missing = sorted_missing(&policy.required, table);
    if !required_missing.is_empty() {
        return Err(TraktError::policy(
            "rename",
            format!("Missing required columns for rename: {required_missing:?}."),
        ));
    }

    let optional_missing = sorted_missing(&policy.optional, table);
    if !optional_missing.is_empty() && policy.warn_on_missing_optional {
        emit(
            ctx,
            names::RENAME_OPTIONAL_MISSING,
            json!({ "columns": optional_missing }),
        );
    }

    let columns: Vec<String> = table
        .columns()
        .iter()
        .map(|c| policy.mapping.get(c).unwrap_or(c).clone())
        .collect();
    let mut counts: IndexMap<&str, usize> = IndexMap::new();
    for c in &columns {
        *counts.entry(c.as_str()).or_default() += 1;
    }
    let mut duplicated: Vec<&str> = counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(c, _)| c)
        .collect();
    if !duplicated.is_empty() {
        duplicated.sort_unstable();
        return Err(TraktError::policy(
            "rename",
            format!("Rename produced duplicate target columns: {duplicated:?}."),
        ));
    }

    Table::from_rows(columns, table.rows().to_vec())
}

// ============================================================================
// BUILT-IN STEPS
// ============================================================================

fn policy_output(table: Table) -> StepValue {
    StepValue::mapping([("output", StepValue::from(table))])
}

/// `join`: `left` + `right` -> `output`
#[derive(Debug, Default, Clone, Copy)]
pub struct Join;

impl Step for Join {
    fn run(&self, ctx: &RunContext, mut args: StepArgs) -> Result<StepValue, TraktError> {
        let policy = JoinPolicy::from_value(args.literal("policy")?).map_err(TraktError::step)?;
        let left = args.table("left")?;
        let right = args.table("right")?;
        apply_join_policy(&left, &right, &policy, Some(ctx)).map(policy_output)
    }

    fn declared_inputs(&self) -> Vec<String> {
        vec!["left".to_string(), "right".to_string(), "policy".to_string()]
    }

    fn declared_outputs(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn check_bindings(&self, bindings: &IndexMap<String, BindingNode>) -> Result<(), String> {
        check_literal_policy(bindings, |raw| JoinPolicy::from_value(raw).map(|_| ()))
    }
}

/// `dedupe`: `input` -> `output`
#[derive(Debug, Default, Clone, Copy)]
pub struct Dedupe;

impl Step for Dedupe {
    fn run(&self, _ctx: &RunContext, mut args: StepArgs) -> Result<StepValue, TraktError> {
        let policy = DedupePolicy::from_value(args.literal("policy")?).map_err(TraktError::step)?;
        let input = args.table("input")?;
        apply_dedupe_policy(&input, &policy).map(policy_output)
    }

    fn declared_inputs(&self) -> Vec<String> {
        vec!["input".to_string(), "policy".to_string()]
    }

    fn declared_outputs(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn check_bindings(&self, bindings: &IndexMap<String, BindingNode>) -> Result<(), String> {
        check_literal_policy(bindings, |raw| DedupePolicy::from_value(raw).map(|_| ()))
    }
}

/// `rename`: `input` -> `output`
#[derive(Debug, Default, Clone, Copy)]
pub struct Rename;

impl Step for Rename {
    fn run(&self, ctx: &RunContext, mut args: StepArgs) -> Result<StepValue, TraktError> {
        let policy = RenamePolicy::from_value(args.literal("policy")?).map_err(TraktError::step)?;
        let input = args.table("input")?;
        apply_rename_policy(&input, &policy, Some(ctx)).map(policy_output)
    }

    fn declared_inputs(&self) -> Vec<String> {
        vec!["input".to_string(), "policy".to_string()]
    }

    fn declared_outputs(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn check_bindings(&self, bindings: &IndexMap<String, BindingNode>) -> Result<(), String> {
        check_literal_policy(bindings, |raw| RenamePolicy::from_value(raw).map(|_| ()))
    }
}
