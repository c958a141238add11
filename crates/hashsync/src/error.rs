//! Error types for the synchronization engine.

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed message, unknown verb, or a peer violating the wire
    /// contract (e.g. a delivered row outside its declared range).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Tables, columns, or key definitions differ in a non-ignorable way.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Driver-level failure (connectivity, constraint, deadlock).
    #[error("Database error: {0}")]
    Database(String),

    /// Cooperative cancellation; carries no new information.
    #[error("Aborted by another worker")]
    Aborted,

    /// Stream closed unexpectedly or other transport failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Create a Protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        SyncError::Protocol(message.into())
    }

    /// Create a Database error.
    pub fn database(message: impl Into<String>) -> Self {
        SyncError::Database(message.into())
    }

    /// Whether this error is the cooperative-abort signal rather than a
    /// root cause worth reporting.
    pub fn is_abort(&self) -> bool {
        matches!(self, SyncError::Aborted)
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
