//! # entitrack storage
//!
//! Storage driver capability consumed by the entitrack change-tracking engine.
//!
//! This crate is the lowest layer of entitrack. A driver executes single-row
//! write statements, runs equality queries, and brackets them in a
//! transaction. It never learns about entity states, snapshots or
//! navigations.
//!
//! ## Design Principles
//!
//! - Drivers receive *what* to write (kind, table, values, predicate); SQL
//!   text, connections and transport stay inside the driver
//! - Every write reports its affected-row count; the engine derives
//!   optimistic-concurrency conflicts from it
//! - Store-generated keys and row versions are reported back, never computed
//!   client-side
//!
//! ## Available Drivers
//!
//! - [`InMemoryDriver`] - connection to a shared [`InMemoryStore`], for tests
//!   and examples
//!
//! ## Example
//!
//! ```rust
//! use entitrack_storage::{InMemoryStore, Predicate, StorageDriver, TableMeta, Value};
//!
//! let meta = TableMeta::new("Standard", vec!["StandardId".into()]);
//! let store = InMemoryStore::new();
//! store.create_table(&meta);
//!
//! let mut driver = store.connect();
//! let rows = driver.query(&meta, &Predicate::new().and_eq("StandardId", 1)).unwrap();
//! assert!(rows.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
mod memory;
mod value;

pub use driver::{
    Predicate, StatementKind, StorageDriver, TableMeta, TransactionHandle, WriteOutcome,
};
pub use error::{StorageError, StorageResult};
pub use memory::{InMemoryDriver, InMemoryStore};
pub use value::{Row, Value};
