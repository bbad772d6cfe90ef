//! Storage driver capability consumed by the change-tracking engine.

use crate::error::StorageResult;
use crate::value::{Row, Value};
use std::fmt;

/// Kind of write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Insert a new row.
    Insert,
    /// Update existing rows matching the predicate.
    Update,
    /// Delete rows matching the predicate.
    Delete,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementKind::Insert => write!(f, "INSERT"),
            StatementKind::Update => write!(f, "UPDATE"),
            StatementKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Table metadata handed to the driver with every statement.
///
/// This is everything the driver learns about the entity model; it never
/// sees navigations or tracking state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    /// Table name.
    pub name: String,
    /// Ordered key columns.
    pub key_columns: Vec<String>,
    /// Key column whose value is generated by the store on insert.
    pub generated_key: Option<String>,
    /// Row-version column refreshed by the store on every write.
    pub token_column: Option<String>,
    /// All scalar columns, keys included.
    pub columns: Vec<String>,
}

impl TableMeta {
    /// Creates table metadata with the given name and key columns.
    pub fn new(name: impl Into<String>, key_columns: Vec<String>) -> Self {
        let columns = key_columns.clone();
        Self {
            name: name.into(),
            key_columns,
            generated_key: None,
            token_column: None,
            columns,
        }
    }

    /// Marks a key column as store-generated.
    #[must_use]
    pub fn with_generated_key(mut self, column: impl Into<String>) -> Self {
        self.generated_key = Some(column.into());
        self
    }

    /// Sets the row-version column.
    #[must_use]
    pub fn with_token(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        if !self.columns.contains(&column) {
            self.columns.push(column.clone());
        }
        self.token_column = Some(column);
        self
    }

    /// Adds a scalar column.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        if !self.columns.contains(&column) {
            self.columns.push(column);
        }
        self
    }
}

/// Conjunction of column equality tests.
///
/// A column compared against [`Value::Null`] matches only NULL, mirroring
/// `IS NULL` rather than SQL's three-valued `= NULL`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    terms: Vec<(String, Value)>,
}

impl Predicate {
    /// Creates an empty predicate (matches every row).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a predicate from column/value pairs.
    pub fn from_pairs<I, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, Value)>,
        C: Into<String>,
    {
        Self {
            terms: pairs.into_iter().map(|(c, v)| (c.into(), v)).collect(),
        }
    }

    /// Adds an equality term.
    #[must_use]
    pub fn and_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(column, value);
        self
    }

    /// Adds an equality term in place. A later term for the same column
    /// replaces the earlier one.
    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        if let Some(term) = self.terms.iter_mut().find(|(c, _)| *c == column) {
            term.1 = value;
        } else {
            self.terms.push((column, value));
        }
    }

    /// Returns the terms.
    pub fn terms(&self) -> &[(String, Value)] {
        &self.terms
    }

    /// Returns the value tested for a column, if any.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.terms
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Returns true if the predicate has no terms.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Evaluates the predicate against a row. Missing columns read as NULL.
    pub fn matches(&self, row: &Row) -> bool {
        self.terms.iter().all(|(column, expected)| {
            let actual = row.get(column).unwrap_or(&Value::Null);
            actual == expected
        })
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "TRUE");
        }
        for (i, (column, value)) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, " AND ")?;
            }
            write!(f, "{column} = {value}")?;
        }
        Ok(())
    }
}

/// What the driver reports after executing a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Number of rows the statement affected.
    pub rows_affected: u64,
    /// Key generated by the store for an insert.
    pub generated_key: Option<Value>,
    /// New row-version value written by the store.
    pub token: Option<Value>,
}

impl WriteOutcome {
    /// Outcome with only an affected-row count.
    #[must_use]
    pub fn rows(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }
}

/// Opaque handle to a driver transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionHandle(pub u64);

impl TransactionHandle {
    /// Creates a new handle.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// The storage capability a session runs against.
///
/// Drivers own SQL generation, connections, and transport. The engine only
/// tells them *what* to write: a statement kind, the table, the column values
/// and an equality predicate.
///
/// # Invariants
///
/// - `execute` reports the exact number of rows the statement matched; the
///   engine treats `0` on an update or delete as a concurrency conflict
/// - `commit`/`rollback` end the transaction opened by `begin_transaction`
/// - A driver handle belongs to one session; it need not be `Sync`
pub trait StorageDriver: Send {
    /// Executes a write statement.
    ///
    /// For inserts `values` is the full row and `predicate` is empty. For
    /// updates `values` holds the columns to set. For deletes `values` is
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement cannot be executed.
    fn execute(
        &mut self,
        kind: StatementKind,
        table: &TableMeta,
        values: &Row,
        predicate: &Predicate,
    ) -> StorageResult<WriteOutcome>;

    /// Returns all rows of `table` matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    fn query(&mut self, table: &TableMeta, predicate: &Predicate) -> StorageResult<Vec<Row>>;

    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction is already active or cannot start.
    fn begin_transaction(&mut self) -> StorageResult<TransactionHandle>;

    /// Commits a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is not the active transaction.
    fn commit(&mut self, handle: TransactionHandle) -> StorageResult<()>;

    /// Rolls a transaction back.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is not the active transaction.
    fn rollback(&mut self, handle: TransactionHandle) -> StorageResult<()>;
}

impl<D: StorageDriver + ?Sized> StorageDriver for Box<D> {
    fn execute(
        &mut self,
        kind: StatementKind,
        table: &TableMeta,
        values: &Row,
        predicate: &Predicate,
    ) -> StorageResult<WriteOutcome> {
        (**self).execute(kind, table, values, predicate)
    }

    fn query(&mut self, table: &TableMeta, predicate: &Predicate) -> StorageResult<Vec<Row>> {
        (**self).query(table, predicate)
    }

    fn begin_transaction(&mut self) -> StorageResult<TransactionHandle> {
        (**self).begin_transaction()
    }

    fn commit(&mut self, handle: TransactionHandle) -> StorageResult<()> {
        (**self).commit(handle)
    }

    fn rollback(&mut self, handle: TransactionHandle) -> StorageResult<()> {
        (**self).rollback(handle)
    }
}
