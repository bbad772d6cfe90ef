//! Error types for storage driver operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors reported by a storage driver.
///
/// The change-tracking engine never inspects these beyond propagating them;
/// every one of them aborts the surrounding save and triggers a rollback.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The referenced table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A row with the same key already exists.
    #[error("duplicate key in table {table}: {key}")]
    DuplicateKey {
        /// Table name.
        table: String,
        /// Rendered key.
        key: String,
    },

    /// A column failed validation (missing, wrong shape).
    #[error("invalid column {column} in table {table}: {message}")]
    InvalidColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Description of the problem.
        message: String,
    },

    /// The transaction handle is unknown or already finished.
    #[error("no active transaction {0}")]
    NoActiveTransaction(u64),

    /// A transaction is already open on this connection.
    #[error("transaction {0} already active on this connection")]
    TransactionActive(u64),

    /// Generic driver failure.
    #[error("driver failure: {0}")]
    Driver(String),
}

impl StorageError {
    /// Creates a generic driver failure.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver(message.into())
    }

    /// Creates an invalid column error.
    pub fn invalid_column(
        table: impl Into<String>,
        column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidColumn {
            table: table.into(),
            column: column.into(),
            message: message.into(),
        }
    }
}
