//! Application of journal deltas to local writers.

use crate::error::ReplicationError;
use crate::metrics::ClientMetrics;
use journal_repl_core::store::lock_writer;
use journal_repl_core::{ColumnValue, JournalStructure, Row, WriterHandle};
use journal_repl_proto::JournalDelta;

/// Appends deltas for one subscription to its local writer.
///
/// Rows are appended and the origin transaction is staged, but nothing is
/// committed here; the embedding application decides when replicated rows
/// become visible.
pub struct DeltaApplier {
    writer: WriterHandle,
    structure: JournalStructure,
}

impl DeltaApplier {
    /// Bind an applier to `writer`, whose layout is `structure`.
    #[must_use]
    pub fn new(writer: WriterHandle, structure: JournalStructure) -> Self {
        Self { writer, structure }
    }

    /// Structure rows are validated against.
    #[must_use]
    pub fn structure(&self) -> &JournalStructure {
        &self.structure
    }

    /// Validate and append every row of `delta`.
    ///
    /// The whole delta is checked before the first row is appended, so a
    /// malformed delta leaves the writer untouched.
    ///
    /// # Errors
    ///
    /// Returns `ReplicationError::Protocol` if a row does not fit the
    /// structure, or a store error if the writer rejects a row.
    pub fn apply(&self, delta: JournalDelta, metrics: &ClientMetrics) -> Result<u64, ReplicationError> {
        let rows = delta
            .rows
            .into_iter()
            .enumerate()
            .map(|(i, cells)| self.row(i, cells))
            .collect::<Result<Vec<_>, _>>()?;
        let count = rows.len() as u64;

        let mut writer = lock_writer(&self.writer)?;
        for row in rows {
            writer.append_row(row)?;
        }
        writer.stage_tx(delta.tx, delta.tx_pin);
        drop(writer);

        metrics.delta_applied(count);
        tracing::trace!(
            journal = %self.structure.location,
            rows = count,
            tx = delta.tx,
            "Delta applied"
        );
        Ok(count)
    }

    fn row(&self, position: usize, cells: Vec<Option<ColumnValue>>) -> Result<Row, ReplicationError> {
        let columns = &self.structure.columns;
        if cells.len() != columns.len() {
            return Err(ReplicationError::Protocol(format!(
                "{}: delta row {position} has {} cells, journal has {} columns",
                self.structure.location,
                cells.len(),
                columns.len()
            )));
        }

        let mut row = Row::new();
        for (col, (cell, column)) in cells.into_iter().zip(columns).enumerate() {
            let Some(value) = cell else {
                continue;
            };
            if value.column_type() != column.column_type {
                return Err(ReplicationError::Protocol(format!(
                    "{}: delta row {position} column {} expects {:?}, got {:?}",
                    self.structure.location,
                    column.name,
                    column.column_type,
                    value.column_type()
                )));
            }
            if !value.is_empty() {
                row.push(col, value);
            }
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journal_repl_core::{ColumnMetadata, ColumnType, JournalWriter, MemoryJournal};
    use std::sync::{Arc, Mutex};

    fn trades() -> JournalStructure {
        JournalStructure::new("trades")
            .column(ColumnMetadata::new("sym", ColumnType::Symbol))
            .column(ColumnMetadata::new("price", ColumnType::Double))
            .column(ColumnMetadata::new("note", ColumnType::String))
    }

    fn applier() -> (DeltaApplier, Arc<Mutex<MemoryJournal>>) {
        let journal = Arc::new(Mutex::new(MemoryJournal::new(trades())));
        let handle: WriterHandle = journal.clone();
        (DeltaApplier::new(handle, trades()), journal)
    }

    #[test]
    fn rows_appended_without_commit() {
        let (applier, journal) = applier();
        let metrics = ClientMetrics::new();
        let delta = JournalDelta::new(7, 2)
            .row(vec![
                Some(ColumnValue::Symbol("ABC".into())),
                Some(ColumnValue::Double(1.5)),
                None,
            ])
            .row(vec![
                Some(ColumnValue::Symbol("XYZ".into())),
                None,
                Some(ColumnValue::String("late".into())),
            ]);

        assert_eq!(applier.apply(delta, &metrics).unwrap(), 2);

        let mut journal = journal.lock().unwrap();
        assert_eq!(journal.pending_rows(), 2);
        assert_eq!(journal.state().rows, 0);

        let state = journal.commit().unwrap();
        assert_eq!(state.tx, 7);
        assert_eq!(state.tx_pin, 2);
        assert_eq!(metrics.snapshot().rows_applied, 2);
    }

    #[test]
    fn absent_and_empty_cells_skipped() {
        let (applier, journal) = applier();
        let delta = JournalDelta::new(1, 1).row(vec![
            Some(ColumnValue::Symbol("ABC".into())),
            None,
            Some(ColumnValue::String(String::new())),
        ]);

        applier.apply(delta, &ClientMetrics::new()).unwrap();

        let mut journal = journal.lock().unwrap();
        journal.commit().unwrap();
        let row = &journal.rows()[0];
        assert_eq!(row.len(), 1);
        assert_eq!(row.get(0), Some(&ColumnValue::Symbol("ABC".into())));
        assert_eq!(row.get(2), None);
    }

    #[test]
    fn wrong_cell_count_is_protocol_error() {
        let (applier, journal) = applier();
        let delta = JournalDelta::new(1, 1)
            .row(vec![None, None, None])
            .row(vec![Some(ColumnValue::Symbol("ABC".into()))]);

        let err = applier.apply(delta, &ClientMetrics::new()).unwrap_err();

        assert!(matches!(err, ReplicationError::Protocol(_)));
        assert_eq!(journal.lock().unwrap().pending_rows(), 0);
    }

    #[test]
    fn wrong_cell_type_is_protocol_error() {
        let (applier, _journal) = applier();
        let delta = JournalDelta::new(1, 1).row(vec![None, Some(ColumnValue::Long(3)), None]);

        let err = applier.apply(delta, &ClientMetrics::new()).unwrap_err();
        assert!(err.to_string().contains("price"));
    }
}
