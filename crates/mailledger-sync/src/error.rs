//! Error types for the sync engine.

use std::time::Duration;

use thiserror::Error;

/// SQLite primary result codes that mean the database file cannot be trusted.
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// Errors that can occur in sync engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote API call failed.
    #[error("Remote error: {0}")]
    Remote(#[from] mailledger_remote::Error),

    /// The on-disk schema was written by a different version.
    #[error("Store schema version {found} does not match expected version {expected}")]
    StoreVersionMismatch {
        /// Version found on disk.
        found: i64,
        /// Version this build expects.
        expected: i64,
    },

    /// The database failed its integrity check.
    #[error("Store is corrupt: {0}")]
    StoreCorruption(String),

    /// A write would exceed the storage quota.
    #[error("Storage quota exceeded: need {needed} more bytes, {available} available")]
    QuotaExceeded {
        /// Bytes that would have to be freed for the write to fit.
        needed: u64,
        /// Bytes left under the quota before the write.
        available: u64,
    },

    /// A unit did not answer in time.
    #[error("{unit} did not reply within {after:?}")]
    Timeout {
        /// Unit that was called.
        unit: &'static str,
        /// Timeout that elapsed.
        after: Duration,
    },

    /// A unit's channel is closed.
    #[error("{0} is not running")]
    UnitUnavailable(&'static str),

    /// A unit answered with a reply of the wrong kind.
    #[error("Unexpected reply from {0}")]
    UnexpectedReply(&'static str),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The write is not allowed through this operation.
    #[error("Invalid write: {0}")]
    InvalidWrite(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true if the operation may succeed when retried later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_transient(),
            Self::Timeout { .. } | Self::UnitUnavailable(_) => true,
            _ => false,
        }
    }

    /// Returns true if the store must be wiped and rebuilt.
    #[must_use]
    pub fn requires_recovery(&self) -> bool {
        match self {
            Self::StoreVersionMismatch { .. } | Self::StoreCorruption(_) => true,
            Self::Database(e) => e
                .as_database_error()
                .and_then(|db| db.code())
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, SQLITE_CORRUPT | SQLITE_NOTADB)),
            _ => false,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
