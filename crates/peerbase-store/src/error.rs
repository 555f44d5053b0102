//! Error types for the store module.

use peerbase_core::SchemaError;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// `create` on an id that already has a live record.
    #[error("record {table}/{id} already exists")]
    DuplicateKey { table: String, id: String },

    /// `update` on an id with no live record.
    #[error("record {table}/{id} not found")]
    NotFound { table: String, id: String },

    /// The table is not part of the store's schema.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Record fields do not fit the table schema.
    #[error("validation error: {0}")]
    Validation(#[from] SchemaError),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking task running a database operation failed.
    #[error("storage task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Whether the error is about the shape of the input rather than the
    /// health of the store. Replicated records failing this way are skipped.
    pub fn is_rejection(&self) -> bool {
        matches!(self, StoreError::UnknownTable(_) | StoreError::Validation(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
