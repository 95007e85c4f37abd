//! `SQLite`-backed journals.
//!
//! Each journal is a row in the `journals` catalog, which holds its CBOR
//! structure and committed state, plus a `journal_<id>` table of CBOR rows.
//! Replicated rows stay in memory until the agent commits them.

use journal_repl_core::store::lock_writer;
use journal_repl_core::{
    ColumnValue, JournalState, JournalStructure, JournalWriter, Row, StoreError, TxListener,
    WriterFactory, WriterHandle,
};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Opens journals stored in one `SQLite` database.
///
/// Writers handed out are remembered so [`commit_all`](Self::commit_all) can
/// make replicated rows durable on the agent's schedule.
pub struct SqliteWriterFactory {
    conn: Arc<Mutex<Connection>>,
    open: Mutex<HashMap<String, WriterHandle>>,
}

impl SqliteWriterFactory {
    /// Open or create a database.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be created.
    #[cfg(test)]
    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS journals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location TEXT NOT NULL UNIQUE,
                structure BLOB NOT NULL,
                tx INTEGER NOT NULL,
                tx_pin INTEGER NOT NULL,
                row_count INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Commit pending rows of every open journal.
    ///
    /// Closed journals are forgotten. Returns how many journals advanced.
    ///
    /// # Errors
    ///
    /// Returns the first storage failure.
    pub fn commit_all(&self) -> Result<usize, StoreError> {
        let mut open = self.open.lock().map_err(|_| StoreError::Poisoned)?;
        let mut advanced = 0;
        let mut closed = Vec::new();

        for (location, handle) in open.iter() {
            let mut writer = lock_writer(handle)?;
            let before = writer.state();
            match writer.commit() {
                Ok(after) if after != before => {
                    advanced += 1;
                    tracing::debug!(
                        journal = %location,
                        tx = after.tx,
                        rows = after.rows,
                        "Committed replicated rows"
                    );
                }
                Ok(_) => {}
                Err(StoreError::Closed(_)) => closed.push(location.clone()),
                Err(err) => return Err(err),
            }
        }

        for location in closed {
            open.remove(&location);
        }
        Ok(advanced)
    }

    /// Committed state of the journal at `location`, if it exists.
    ///
    /// # Errors
    ///
    /// Returns error if the catalog cannot be read.
    pub fn state(&self, location: &str) -> Result<Option<JournalState>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(find(&conn, location)?.map(|entry| entry.state))
    }

    /// Committed rows of the journal at `location`, in commit order.
    ///
    /// # Errors
    ///
    /// Returns error if the journal cannot be read.
    #[cfg(test)]
    pub fn rows(&self, location: &str) -> Result<Vec<Row>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let Some(entry) = find(&conn, location)? else {
            return Ok(Vec::new());
        };

        let mut stmt = conn
            .prepare(&format!("SELECT cells FROM {} ORDER BY seq ASC", table(entry.id)))
            .map_err(backend)?;
        let blobs = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;
        blobs.iter().map(|blob| decode_row(blob)).collect()
    }
}

impl WriterFactory for SqliteWriterFactory {
    fn writer(&self, structure: &JournalStructure) -> Result<WriterHandle, StoreError> {
        let (id, state) = {
            let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
            match find(&conn, &structure.location)? {
                Some(entry) => {
                    let stored = JournalStructure::from_cbor(&entry.structure)?;
                    stored.check_compatible(structure)?;
                    (entry.id, entry.state)
                }
                None => (create(&conn, structure)?, JournalState::default()),
            }
        };

        tracing::debug!(
            journal = %structure.location,
            id,
            rows = state.rows,
            "Opened journal"
        );

        let journal = SqliteJournal {
            id,
            structure: structure.clone(),
            conn: self.conn.clone(),
            pending: Vec::new(),
            state,
            staged: None,
            commit_on_close: true,
            listener: None,
            closed: false,
        };
        let handle: WriterHandle = Arc::new(Mutex::new(journal));

        self.open
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(structure.location.clone(), handle.clone());
        Ok(handle)
    }
}

/// One journal in the database.
struct SqliteJournal {
    id: i64,
    structure: JournalStructure,
    conn: Arc<Mutex<Connection>>,
    pending: Vec<Row>,
    state: JournalState,
    staged: Option<(u64, u64)>,
    commit_on_close: bool,
    listener: Option<Arc<dyn TxListener>>,
    closed: bool,
}

impl SqliteJournal {
    fn write(&self, rows: &[Row], state: JournalState) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction().map_err(backend)?;
        {
            let mut insert = tx
                .prepare_cached(&format!("INSERT INTO {} (cells) VALUES (?1)", table(self.id)))
                .map_err(backend)?;
            for row in rows {
                insert.execute([encode_row(row)?]).map_err(backend)?;
            }
        }
        tx.execute(
            r"
            UPDATE journals SET tx = ?1, tx_pin = ?2, row_count = ?3, updated_at = ?4
            WHERE id = ?5
            ",
            (
                to_i64(state.tx)?,
                to_i64(state.tx_pin)?,
                to_i64(state.rows)?,
                chrono::Utc::now().timestamp_millis(),
                self.id,
            ),
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)
    }
}

impl JournalWriter for SqliteJournal {
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

        let mut next = self.state;
        next.rows += self.pending.len() as u64;
        match self.staged {
            Some((tx, tx_pin)) => {
                next.tx = tx;
                next.tx_pin = tx_pin;
            }
            None => {
                next.tx += 1;
                next.tx_pin = next.rows;
            }
        }

        self.write(&self.pending, next)?;
        self.pending.clear();
        self.staged = None;
        self.state = next;

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
                journal = %self.structure.location,
                discarded = self.pending.len(),
                "Discarding uncommitted rows on close"
            );
        }
        self.pending.clear();
        self.staged = None;
        self.closed = true;
        Ok(())
    }
}

struct CatalogEntry {
    id: i64,
    structure: Vec<u8>,
    state: JournalState,
}

fn find(conn: &Connection, location: &str) -> Result<Option<CatalogEntry>, StoreError> {
    let row = conn
        .query_row(
            r"
            SELECT id, structure, tx, tx_pin, row_count FROM journals
            WHERE location = ?1
            ",
            [location],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()
        .map_err(backend)?;

    row.map(|(id, structure, tx, tx_pin, rows)| {
        Ok(CatalogEntry {
            id,
            structure,
            state: JournalState {
                tx: to_u64(tx)?,
                tx_pin: to_u64(tx_pin)?,
                rows: to_u64(rows)?,
            },
        })
    })
    .transpose()
}

fn create(conn: &Connection, structure: &JournalStructure) -> Result<i64, StoreError> {
    conn.execute(
        r"
        INSERT INTO journals (location, structure, tx, tx_pin, row_count, updated_at)
        VALUES (?1, ?2, 0, 0, 0, ?3)
        ",
        (
            &structure.location,
            structure.to_cbor()?,
            chrono::Utc::now().timestamp_millis(),
        ),
    )
    .map_err(backend)?;

    let id = conn.last_insert_rowid();
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (seq INTEGER PRIMARY KEY AUTOINCREMENT, cells BLOB NOT NULL);",
        table(id)
    ))
    .map_err(backend)?;
    Ok(id)
}

fn table(id: i64) -> String {
    format!("journal_{id}")
}

fn encode_row(row: &Row) -> Result<Vec<u8>, StoreError> {
    let cells: Vec<(usize, &ColumnValue)> = row.cells().collect();
    let mut buf = Vec::new();
    ciborium::into_writer(&cells, &mut buf).map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
fn decode_row(bytes: &[u8]) -> Result<Row, StoreError> {
    let cells: Vec<(usize, ColumnValue)> =
        ciborium::from_reader(bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
    let mut row = Row::new();
    for (column, value) in cells {
        row.push(column, value);
    }
    Ok(row)
}

#[allow(clippy::needless_pass_by_value)]
fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|e| StoreError::Backend(e.to_string()))
}

fn to_u64(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|e| StoreError::Backend(e.to_string()))
}
