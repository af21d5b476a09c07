//! Common error types for the enrichment audit core

use thiserror::Error;

/// Common result type for enrichment operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the enrichment crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding of stored payloads
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed request, rejected without retry
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transition not permitted from the current state (caller bug)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Shared fast-storage (queue/lock) failure
    #[error("Queue store error: {0}")]
    Queue(String),

    /// Failure reported by an external collaborator (launcher, API client)
    #[error("External service error: {0}")]
    External(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error is SQLite reporting lock contention
    pub fn is_database_locked(&self) -> bool {
        match self {
            Error::Database(db_err) => db_err.to_string().contains("database is locked"),
            _ => false,
        }
    }
}
