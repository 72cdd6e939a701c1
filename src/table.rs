//! In-memory tabular data
//!
//! - `Cell`: one typed value (null, bool, int, float, string)
//! - `DataType`: inferred column type, widened across values
//! - `Table`: ordered columns + row-major cells

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TraktError;

/// A single typed cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Cell {
    /// Infer a cell from raw text. Empty text is null.
    pub fn parse(raw: &str) -> Self {
        let text = raw.trim();
        if text.is_empty() {
            return Cell::Null;
        }
        if let Ok(v) = text.parse::<i64>() {
            return Cell::Int(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            if v.is_finite() {
                return Cell::Float(v);
            }
        }
        match text {
            "true" | "True" | "TRUE" => Cell::Bool(true),
            "false" | "False" | "FALSE" => Cell::Bool(false),
            _ => Cell::Str(raw.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Cell::Null => DataType::Null,
            Cell::Bool(_) => DataType::Bool,
            Cell::Int(_) => DataType::Int,
            Cell::Float(_) => DataType::Float,
            Cell::Str(_) => DataType::String,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Total order for sorting: numbers compare by value, then bools,
    /// then strings; nulls sort first.
    pub fn compare(&self, other: &Cell) -> Ordering {
        fn rank(cell: &Cell) -> u8 {
            match cell {
                Cell::Null => 0,
                Cell::Int(_) | Cell::Float(_) => 1,
                Cell::Bool(_) => 2,
                Cell::Str(_) => 3,
            }
        }
        match (self, other) {
            (Cell::Bool(a), Cell::Bool(b)) => a.cmp(b),
            (Cell::Str(a), Cell::Str(b)) => a.cmp(b),
            (Cell::Int(a), Cell::Int(b)) => a.cmp(b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => rank(self).cmp(&rank(other)),
            },
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(v) => write!(f, "{v}"),
            Cell::Int(v) => write!(f, "{v}"),
            // keep a fractional part so the value reads back as a float
            Cell::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Cell::Bool(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Str(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Str(v)
    }
}

impl<T: Into<Cell>> From<Option<T>> for Cell {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Cell::Null)
    }
}

/// Column type. `Null` means no non-null value was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Null,
    Bool,
    Int,
    Float,
    String,
}

impl DataType {
    /// Widen two observed types: int + float is float, anything else mixed is string
    pub fn merge(self, other: DataType) -> DataType {
        use DataType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Null, b) => b,
            (a, Null) => a,
            (Int, Float) | (Float, Int) => Float,
            _ => String,
        }
    }

    /// Parse a declared dtype name, accepting common aliases
    pub fn from_name(name: &str) -> Option<DataType> {
        match name.trim().to_ascii_lowercase().as_str() {
            "int" | "int64" | "integer" | "i64" => Some(DataType::Int),
            "float" | "float64" | "double" | "f64" | "number" => Some(DataType::Float),
            "bool" | "boolean" => Some(DataType::Bool),
            "string" | "str" | "object" | "text" => Some(DataType::String),
            "null" => Some(DataType::Null),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Null => "null",
            DataType::Bool => "bool",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::String => "string",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered columns and row-major cells
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Build a table, checking every row has one cell per column
    pub fn from_rows<I, S>(columns: I, rows: Vec<Vec<Cell>>) -> Result<Self, TraktError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Table::new(columns);
        table.rows.reserve(rows.len());
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Cell>> {
        self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), TraktError> {
        if row.len() != self.columns.len() {
            return Err(TraktError::contract(format!(
                "row has {} cells but table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Cell> + '_> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }

    /// Inferred dtype of one column
    pub fn dtype(&self, name: &str) -> Option<DataType> {
        self.column(name)
            .map(|cells| cells.fold(DataType::Null, |acc, c| acc.merge(c.dtype())))
    }

    /// Inferred dtypes of every column, in column order
    pub fn dtypes(&self) -> Vec<(String, DataType)> {
        let mut types = vec![DataType::Null; self.columns.len()];
        for row in &self.rows {
            for (slot, cell) in types.iter_mut().zip(row) {
                *slot = slot.merge(cell.dtype());
            }
        }
        self.columns.iter().cloned().zip(types).collect()
    }

    /// Rewrite every cell of one column
    pub fn map_column<F>(&mut self, name: &str, mut f: F) -> Result<(), TraktError>
    where
        F: FnMut(&Cell) -> Cell,
    {
        let idx = self
            .column_index(name)
            .ok_or_else(|| TraktError::step(format!("column '{name}' not found")))?;
        for row in &mut self.rows {
            row[idx] = f(&row[idx]);
        }
        Ok(())
    }

    /// Keep rows matching a predicate
    pub fn filter_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&[Cell]) -> bool,
    {
        self.rows.retain(|row| keep(row));
    }

    /// Append rows of a table with identical columns
    pub fn append(&mut self, other: Table) -> Result<(), TraktError> {
        if other.columns != self.columns {
            return Err(TraktError::contract(format!(
                "cannot append table with columns {:?} to table with columns {:?}",
                other.columns, self.columns
            )));
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// Project onto `columns`, filling absent ones with nulls
    pub fn reindex(self, columns: &[String]) -> Table {
        let mapping: Vec<Option<usize>> =
            columns.iter().map(|c| self.column_index(c)).collect();
        let rows = self
            .rows
            .into_iter()
            .map(|row| {
                mapping
                    .iter()
                    .map(|idx| idx.map(|i| row[i].clone()).unwrap_or(Cell::Null))
                    .collect()
            })
            .collect();
        Table {
            columns: columns.to_vec(),
            rows,
        }
    }
}
