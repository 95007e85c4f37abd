//! # Journal Replication Core
//!
//! Data model shared by the replication protocol, the client engine, and the
//! local stores that replicated rows land in.
//!
//! This crate provides:
//! - Journal identity (`JournalKey`) and partitioning strategy
//! - Structural descriptors (`JournalStructure`) exchanged as journal metadata
//! - The row model used by deltas (`ColumnValue`, `Row`)
//! - The storage interface the engine writes through (`JournalWriter`,
//!   `WriterFactory`, `TxListener`) and an in-memory reference store

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod key;
pub mod row;
pub mod store;
pub mod structure;

pub use key::{JournalKey, PartitionBy};
pub use row::{ColumnValue, Row};
pub use store::{
    JournalWriter, MemoryJournal, MemoryWriterFactory, StoreError, TxListener, WriterFactory,
    WriterHandle,
};
pub use structure::{ColumnMetadata, ColumnType, JournalState, JournalStructure};
