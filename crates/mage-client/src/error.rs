//! Error types for the MAGE client.
//!
//! Errors are `Clone` because a single transport failure rejects every
//! command of a batch and is also published on the command center's event
//! channel.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the MAGE client.
#[derive(Debug, Clone, Error)]
pub enum MageError {
    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// HTTP status when the server answered with a non-success code.
        status: Option<u16>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // Protocol errors
    #[error("Invalid response from server: {message}")]
    Protocol { message: String },

    /// Error code returned by the server for a single command.
    #[error("Command failed: {code}")]
    Command { code: Value },

    // Consistency errors
    #[error("Client state out of sync with server: {message}")]
    Desync { message: String },

    #[error("Trying to apply a diff on non-mergeable value: {topic} {index}")]
    CacheType { topic: String, index: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unknown command: {name}")]
    UnknownCommand { name: String },

    #[error("Command was dropped before it settled")]
    Cancelled,
}

/// Result type alias for MAGE client operations.
pub type Result<T> = std::result::Result<T, MageError>;

impl From<serde_json::Error> for MageError {
    fn from(err: serde_json::Error) -> Self {
        MageError::Json {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for MageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MageError::Timeout(Duration::from_secs(0))
        } else {
            MageError::Transport {
                message: err.to_string(),
                status: err.status().map(|s| s.as_u16()),
            }
        }
    }
}

impl MageError {
    /// Create a transport error for a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        MageError::Transport {
            message: format!(
                "{} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown Status")
            ),
            status: Some(status.as_u16()),
        }
    }

    /// Map a reqwest error, recording the timeout that was applied.
    pub fn from_request(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            MageError::Timeout(timeout)
        } else {
            err.into()
        }
    }

    /// Whether the error means the local cache can no longer be trusted.
    pub fn is_desync(&self) -> bool {
        matches!(self, MageError::Desync { .. } | MageError::CacheType { .. })
    }

    /// Whether the error came from the network layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, MageError::Transport { .. } | MageError::Timeout(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MageError::Timeout(_))
    }
}
