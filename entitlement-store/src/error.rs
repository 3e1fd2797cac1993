//! Error types for the record store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur reading or writing the entitlement database.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite reported an error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A row violates a record invariant.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A thread panicked while holding the connection.
    #[error("store connection lock poisoned")]
    LockPoisoned,
}
