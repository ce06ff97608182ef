//! Error types for the stratadb record store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Unknown type path, missing id field, field not in schema.
    /// Recoverable by the caller retrying with corrected input.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Malformed backend statement text. A programming or configuration
    /// defect; never retried.
    #[error("Statement build error: {0}")]
    StatementBuild(String),

    /// Backend execution failure. Carries the failing statement text for
    /// diagnostics plus one cause per failed row.
    #[error("Backend error executing `{statement}`: {message}")]
    Backend {
        statement: String,
        message: String,
        row_errors: Vec<String>,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A write observed a record state it cannot dispatch. Always fatal,
    /// never silently ignored.
    #[error("Unknown record state: {0}")]
    State(String),

    #[error("Query error: {0}")]
    Query(String),

    /// The owning store was torn down while a namespace or iterator still
    /// referenced it.
    #[error("Record store is closed")]
    StoreClosed,

    #[error("Connection error: {0}")]
    Connection(String),
}

impl StoreError {
    /// Build a backend error with no per-row detail.
    pub fn backend(statement: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Backend {
            statement: statement.into(),
            message: message.into(),
            row_errors: Vec::new(),
        }
    }
}
