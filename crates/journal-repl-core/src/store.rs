//! Storage interface the replication engine writes through.
//!
//! The on-disk journal engine is an external collaborator. The engine only
//! needs to open-or-create a journal from a structural descriptor, append
//! rows, report committed state and control commit-on-close. Commits are
//! issued by the embedding application, never by the engine itself.

use crate::row::Row;
use crate::structure::{JournalState, JournalStructure};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Commit notification callback.
///
/// Invoked synchronously by the writer whenever its transaction advances;
/// implementations must not block.
pub trait TxListener: Send + Sync {
    /// Called after a commit of the journal at `location`.
    fn on_commit(&self, location: &str, state: JournalState);
}

impl<F> TxListener for F
where
    F: Fn(&str, JournalState) + Send + Sync,
{
    fn on_commit(&self, location: &str, state: JournalState) {
        self(location, state);
    }
}

/// Append-side handle of a local journal.
pub trait JournalWriter: Send {
    /// Structure the journal was opened with.
    fn structure(&self) -> &JournalStructure;

    /// Append a row to the uncommitted tail of the journal.
    ///
    /// # Errors
    ///
    /// Returns error if the journal is closed or the backend rejects the row.
    fn append_row(&mut self, row: Row) -> Result<(), StoreError>;

    /// Record the origin transaction the pending rows belong to. The next
    /// commit adopts it instead of minting a local transaction number.
    fn stage_tx(&mut self, tx: u64, tx_pin: u64);

    /// Make pending rows durable and visible.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails to persist the rows.
    fn commit(&mut self) -> Result<JournalState, StoreError>;

    /// Committed state of the journal.
    fn state(&self) -> JournalState;

    /// Rows appended since the last commit.
    fn pending_rows(&self) -> usize;

    /// Whether `close` commits pending rows or discards them.
    fn set_commit_on_close(&mut self, commit_on_close: bool);

    /// Install or clear the commit listener.
    fn set_tx_listener(&mut self, listener: Option<Arc<dyn TxListener>>);

    /// Release the journal.
    ///
    /// # Errors
    ///
    /// Returns error if a commit-on-close fails.
    fn close(&mut self) -> Result<(), StoreError>;
}

/// Shared handle to a writer. The engine appends through it while the
/// embedding application commits through its own clone.
pub type WriterHandle = Arc<Mutex<dyn JournalWriter>>;

/// Lock a writer handle.
///
/// # Errors
///
/// Returns `StoreError::Poisoned` if a previous holder panicked.
pub fn lock_writer(
    handle: &WriterHandle,
) -> Result<MutexGuard<'_, dyn JournalWriter + 'static>, StoreError> {
    handle.lock().map_err(|_| StoreError::Poisoned)
}

/// Opens local journals.
pub trait WriterFactory: Send + Sync {
    /// Open the journal described by `structure`, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Incompatible` if a journal already exists at the
    /// location with a different column layout, or a backend error.
    fn writer(&self, structure: &JournalStructure) -> Result<WriterHandle, StoreError>;
}

/// Errors raised by local journal stores.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Structure cannot be reconciled with an existing journal
    #[error("incompatible journal at {location}: {reason}")]
    Incompatible {
        /// Journal location
        location: String,
        /// What differs
        reason: String,
    },
    /// Metadata could not be encoded or decoded
    #[error("metadata error: {0}")]
    Metadata(String),
    /// Writer was used after close
    #[error("journal closed: {0}")]
    Closed(String),
    /// Writer lock poisoned by a panicking holder
    #[error("journal writer lock poisoned")]
    Poisoned,
    /// Storage backend failure
    #[error("storage error: {0}")]
    Backend(String),
}

/// In-memory journal, the reference `JournalWriter`.
///
/// Commit-on-close is enabled by default, as with on-disk writers.
pub struct MemoryJournal {
    structure: JournalStructure,
    committed: Vec<Row>,
    pending: Vec<Row>,
    state: JournalState,
    staged: Option<(u64, u64)>,
    commit_on_close: bool,
    listener: Option<Arc<dyn TxListener>>,
    closed: bool,
}

impl MemoryJournal {
    /// Create an empty journal.
    #[must_use]
    pub fn new(structure: JournalStructure) -> Self {
        Self {
            structure,
            committed: Vec::new(),
            pending: Vec::new(),
            state: JournalState::default(),
            staged: None,
            commit_on_close: true,
            listener: None,
            closed: false,
        }
    }

    /// Committed rows.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.committed
    }

    /// Whether `close` commits pending rows.
    #[must_use]
    pub fn commit_on_close(&self) -> bool {
        self.commit_on_close
    }

    /// Whether the journal has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn reopen(&mut self) {
        self.closed = false;
        self.commit_on_close = true;
    }
}

impl JournalWriter for MemoryJournal {
    fn structure(&self) -> &JournalStructure {
        &self.structure
    }

    fn append_row(&mut self, row: Row) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed(self.structure.location.clone()));
        }
        self.pending.push(row);
        Ok(())
    }

    fn stage_tx(&mut self, tx: u64, tx_pin: u64) {
        self.staged = Some((tx, tx_pin));
    }

    fn commit(&mut self) -> Result<JournalState, StoreError> {
        if self.closed {
            return Err(StoreError::Closed(self.structure.location.clone()));
        }
        if self.pending.is_empty() && self.staged.is_none() {
            return Ok(self.state);
        }

        let appended = self.pending.len() as u64;
        self.committed.append(&mut self.pending);
        self.state.rows += appended;
        match self.staged.take() {
            Some((tx, tx_pin)) => {
                self.state.tx = tx;
                self.state.tx_pin = tx_pin;
            }
            None => {
                self.state.tx += 1;
                self.state.tx_pin = self.state.rows;
            }
        }

        if let Some(listener) = &self.listener {
            listener.on_commit(&self.structure.location, self.state);
        }
        Ok(self.state)
    }

    fn state(&self) -> JournalState {
        self.state
    }

    fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    fn set_commit_on_close(&mut self, commit_on_close: bool) {
        self.commit_on_close = commit_on_close;
    }

    fn set_tx_listener(&mut self, listener: Option<Arc<dyn TxListener>>) {
        self.listener = listener;
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        if self.commit_on_close {
            self.commit()?;
        } else if !self.pending.is_empty() {
            tracing::debug!(
                location = %self.structure.location,
                discarded = self.pending.len(),
                "Discarding uncommitted rows on close"
            );
            self.pending.clear();
            self.staged = None;
        }
        self.closed = true;
        Ok(())
    }
}

/// Factory of in-memory journals keyed by location.
///
/// Reopening a location returns the same journal, so committed rows survive
/// across reconnects of a replication client.
#[derive(Default)]
pub struct MemoryWriterFactory {
    journals: Mutex<HashMap<String, Arc<Mutex<MemoryJournal>>>>,
}

impl MemoryWriterFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Journal previously opened at `location`.
    #[must_use]
    pub fn journal(&self, location: &str) -> Option<Arc<Mutex<MemoryJournal>>> {
        self.journals
            .lock()
            .ok()
            .and_then(|journals| journals.get(location).cloned())
    }
}

impl WriterFactory for MemoryWriterFactory {
    fn writer(&self, structure: &JournalStructure) -> Result<WriterHandle, StoreError> {
        let mut journals = self.journals.lock().map_err(|_| StoreError::Poisoned)?;

        if let Some(existing) = journals.get(&structure.location) {
            let mut journal = existing.lock().map_err(|_| StoreError::Poisoned)?;
            journal.structure.check_compatible(structure)?;
            journal.reopen();
            drop(journal);
            let handle: WriterHandle = existing.clone();
            return Ok(handle);
        }

        let journal = Arc::new(Mutex::new(MemoryJournal::new(structure.clone())));
        journals.insert(structure.location.clone(), journal.clone());
        let handle: WriterHandle = journal;
        Ok(handle)
    }
}
