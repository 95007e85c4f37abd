//! Wire records.

use journal_repl_core::{ColumnValue, JournalKey, JournalState};
use serde::{Deserialize, Serialize};

/// A remote journal key bound to a subscription index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedJournalKey {
    /// Subscription index
    pub index: u32,
    /// Remote journal key
    pub key: JournalKey,
}

/// Local state of a subscribed journal, sent in a delta request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedJournalState {
    /// Subscription index
    pub index: u32,
    /// Committed state of the local journal
    pub state: JournalState,
}

/// Row-level changes to one journal since the subscriber's announced state.
///
/// Each row has one cell per journal column, in column order. Absent cells
/// are `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JournalDelta {
    /// Origin transaction the rows belong to
    pub tx: u64,
    /// Origin transaction pin
    pub tx_pin: u64,
    /// Rows in append order
    pub rows: Vec<Vec<Option<ColumnValue>>>,
}

impl JournalDelta {
    /// Create a delta for the given origin transaction.
    #[must_use]
    pub fn new(tx: u64, tx_pin: u64) -> Self {
        Self {
            tx,
            tx_pin,
            rows: Vec::new(),
        }
    }

    /// Append a row.
    #[must_use]
    pub fn row(mut self, cells: Vec<Option<ColumnValue>>) -> Self {
        self.rows.push(cells);
        self
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
