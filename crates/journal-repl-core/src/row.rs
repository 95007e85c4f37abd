//! Row model used by journal deltas.

use crate::structure::ColumnType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum ColumnValue {
    /// Boolean
    Boolean(bool),
    /// Signed 8-bit integer
    Byte(i8),
    /// Signed 16-bit integer
    Short(i16),
    /// Signed 32-bit integer
    Int(i32),
    /// Signed 64-bit integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// Free-form text
    String(String),
    /// Interned text
    Symbol(String),
    /// Opaque bytes
    Binary(Vec<u8>),
    /// UTC timestamp
    Date(DateTime<Utc>),
}

impl ColumnValue {
    /// Storage type this value belongs to.
    #[must_use]
    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Boolean(_) => ColumnType::Boolean,
            Self::Byte(_) => ColumnType::Byte,
            Self::Short(_) => ColumnType::Short,
            Self::Int(_) => ColumnType::Int,
            Self::Long(_) => ColumnType::Long,
            Self::Float(_) => ColumnType::Float,
            Self::Double(_) => ColumnType::Double,
            Self::String(_) => ColumnType::String,
            Self::Symbol(_) => ColumnType::Symbol,
            Self::Binary(_) => ColumnType::Binary,
            Self::Date(_) => ColumnType::Date,
        }
    }

    /// Empty text and empty binary values carry nothing worth storing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::String(s) | Self::Symbol(s) => s.is_empty(),
            Self::Binary(b) => b.is_empty(),
            _ => false,
        }
    }
}

/// A row as appended to a writer: present cells keyed by column index,
/// in ascending column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    cells: Vec<(usize, ColumnValue)>,
}

impl Row {
    /// Create an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column value. Cells must be pushed in ascending column order.
    pub fn push(&mut self, column: usize, value: ColumnValue) {
        debug_assert!(
            self.cells.last().map_or(true, |(last, _)| *last < column),
            "cells must be pushed in column order"
        );
        self.cells.push((column, value));
    }

    /// Value of a column, if present.
    #[must_use]
    pub fn get(&self, column: usize) -> Option<&ColumnValue> {
        self.cells
            .binary_search_by_key(&column, |(i, _)| *i)
            .ok()
            .map(|pos| &self.cells[pos].1)
    }

    /// Present cells in column order.
    pub fn cells(&self) -> impl Iterator<Item = (usize, &ColumnValue)> {
        self.cells.iter().map(|(i, v)| (*i, v))
    }

    /// Number of present cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no cell is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values() {
        assert!(ColumnValue::String(String::new()).is_empty());
        assert!(ColumnValue::Binary(Vec::new()).is_empty());
        assert!(!ColumnValue::Int(0).is_empty());
        assert!(!ColumnValue::Symbol("EURUSD".to_string()).is_empty());
    }

    #[test]
    fn sparse_row_lookup() {
        let mut row = Row::new();
        row.push(0, ColumnValue::Long(7));
        row.push(3, ColumnValue::Symbol("BTC".to_string()));

        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(&ColumnValue::Long(7)));
        assert_eq!(row.get(1), None);
        assert_eq!(row.get(3), Some(&ColumnValue::Symbol("BTC".to_string())));

        let columns: Vec<usize> = row.cells().map(|(i, _)| i).collect();
        assert_eq!(columns, vec![0, 3]);
    }

    #[test]
    fn value_types() {
        assert_eq!(ColumnValue::Double(1.5).column_type(), ColumnType::Double);
        assert_eq!(
            ColumnValue::Date(DateTime::<Utc>::from_timestamp_millis(0).unwrap()).column_type(),
            ColumnType::Date
        );
    }
}
