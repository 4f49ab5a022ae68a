//! Error types for refsync

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for refsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for refsync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stale version: expected {expected}, found {found}")]
    StaleVersion { expected: i64, found: i64 },

    #[error("Lock denied: held by {holder} until {expires_at}")]
    LockDenied {
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("External source unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Unresolvable conflict: {0}")]
    UnresolvableConflict(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::StaleVersion { .. }
                | SyncError::LockDenied { .. }
                | SyncError::AdapterUnavailable(_)
        )
    }
}
