//! Structural descriptors of journals.
//!
//! A `JournalStructure` is what the origin transfers as journal metadata during
//! the handshake. Subscribers that have no local journal yet create one from it,
//! so first-time replicas mirror the remote schema exactly.

use crate::key::PartitionBy;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Boolean
    Boolean,
    /// Signed 8-bit integer
    Byte,
    /// Signed 16-bit integer
    Short,
    /// Signed 32-bit integer
    Int,
    /// Signed 64-bit integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// Free-form text
    String,
    /// Interned text, usually indexed
    Symbol,
    /// Opaque bytes
    Binary,
    /// UTC timestamp with millisecond precision
    Date,
}

/// A single column of a journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// Storage type
    pub column_type: ColumnType,
    /// Whether the column carries a key index
    pub indexed: bool,
}

impl ColumnMetadata {
    /// Create an unindexed column.
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            indexed: false,
        }
    }

    /// Mark the column as indexed.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

/// Structural descriptor of a journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalStructure {
    /// Storage location
    pub location: String,
    /// Partitioning strategy
    pub partition_by: PartitionBy,
    /// Expected record count hint
    pub record_hint: i32,
    /// Columns in storage order
    pub columns: Vec<ColumnMetadata>,
    /// Index of the designated timestamp column, if any
    pub timestamp_column: Option<usize>,
}

impl JournalStructure {
    /// Create an empty structure at the given location.
    #[must_use]
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            partition_by: PartitionBy::Default,
            record_hint: 0,
            columns: Vec::new(),
            timestamp_column: None,
        }
    }

    /// Append a column.
    #[must_use]
    pub fn column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    /// Designate the timestamp column by name. Unknown names are ignored.
    #[must_use]
    pub fn timestamp(mut self, name: &str) -> Self {
        self.timestamp_column = self.columns.iter().position(|c| c.name == name);
        self
    }

    /// Same structure re-rooted at another location.
    #[must_use]
    pub fn relocated(&self, location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..self.clone()
        }
    }

    /// Check that rows shaped by `other` can be appended to a journal shaped by `self`.
    ///
    /// Locations may differ; column names, types and order must not.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Incompatible` describing the first mismatch.
    pub fn check_compatible(&self, other: &Self) -> Result<(), StoreError> {
        let incompatible = |reason: String| StoreError::Incompatible {
            location: self.location.clone(),
            reason,
        };

        if self.columns.len() != other.columns.len() {
            return Err(incompatible(format!(
                "column count differs: local {}, remote {}",
                self.columns.len(),
                other.columns.len()
            )));
        }

        for (i, (local, remote)) in self.columns.iter().zip(&other.columns).enumerate() {
            if local.name != remote.name || local.column_type != remote.column_type {
                return Err(incompatible(format!(
                    "column {i} differs: local {} {:?}, remote {} {:?}",
                    local.name, local.column_type, remote.name, remote.column_type
                )));
            }
        }

        Ok(())
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, StoreError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| StoreError::Metadata(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, StoreError> {
        ciborium::from_reader(bytes).map_err(|e| StoreError::Metadata(e.to_string()))
    }
}

/// Write position and transaction marker of a local journal.
///
/// This is what a subscriber announces in a delta request so the origin can
/// send only what the replica is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JournalState {
    /// Last committed transaction
    pub tx: u64,
    /// Transaction pin of the last commit
    pub tx_pin: u64,
    /// Committed row count
    pub rows: u64,
}
