//! Error types for Lottery Sync
//!
//! The remote store adapter, event bus and state reconciler absorb most of
//! these at their own boundary and only log them. They surface to callers
//! where a caller can act: cache I/O, configuration, rejected state
//! transitions and undeliverable remote commands.

use thiserror::Error;

/// Main error type for Lottery Sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote store unreachable (always recoverable, triggers local mode)
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Malformed cached or remote value
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A registered callback failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Event older than the freshness window
    #[error("Stale event {id}: {age_ms}ms old")]
    StaleEvent {
        /// Event identifier
        id: String,
        /// Age of the event when it was evaluated
        age_ms: i64,
    },

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// A state mutation would break a lottery state invariant
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A remote command could not be delivered and there is no local execution path
    #[error("Remote command cannot be delivered: {0}")]
    CommandUndeliverable(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
