//! Error types for remote API calls.

use thiserror::Error;

/// Errors returned by a [`RemoteApi`](crate::RemoteApi) implementation.
#[derive(Debug, Error)]
pub enum Error {
    /// Network hiccup, timeout or server overload. Safe to retry.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The server rejected the request. Retrying will not help.
    #[error("Server rejected request ({status}): {message}")]
    Permanent {
        /// HTTP-style status code reported by the server.
        status: u16,
        /// Server-provided reason.
        message: String,
    },

    /// The addressed entity does not exist on the server.
    #[error("Not found: {0}")]
    NotFound(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Endpoint URL could not be built.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl Error {
    /// Classify an HTTP status code with its response text.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 | 410 => Self::NotFound(message),
            408 | 425 | 429 | 500..=599 => Self::Transient(format!("status {status}: {message}")),
            _ => Self::Permanent { status, message },
        }
    }

    /// Returns true if the call may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Returns true if the server reported the target as missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
