//! Error types for commlink.
//!
//! Local precondition failures, transport failures, protocol failures and
//! discovery failures all map onto a [`ReplyStatus`] so callers can treat a
//! locally raised error and a status returned by the server the same way.

use crate::status::ReplyStatus;
use thiserror::Error;

/// Main error type for the commlink library.
#[derive(Debug, Error)]
pub enum CommError {
    // Local precondition errors
    #[error("Client is not connected")]
    NotConnected,

    #[error("Already stopped and cannot be restarted")]
    Stopped,

    #[error("Object {object_id} is not tracked by this client")]
    UntrackedObject { object_id: u64 },

    // Remote / protocol errors
    #[error("Remote call failed with {status}: {message}")]
    Status { status: ReplyStatus, message: String },

    #[error("Malformed message: {message}")]
    BadMessage { message: String },

    // Discovery errors
    #[error("Discovery failed for {key}: {message}")]
    Discovery { key: String, message: String },

    // Transport errors
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for commlink operations.
pub type Result<T> = std::result::Result<T, CommError>;

impl From<std::io::Error> for CommError {
    fn from(err: std::io::Error) -> Self {
        CommError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CommError {
    fn from(err: serde_json::Error) -> Self {
        CommError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for CommError {
    fn from(err: rusqlite::Error) -> Self {
        CommError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CommError {
    /// Build a status error from a reply status and its (lossy UTF-8) body.
    pub fn from_status(status: ReplyStatus, body: &[u8]) -> Self {
        CommError::Status {
            status,
            message: String::from_utf8_lossy(body).into_owned(),
        }
    }

    /// The reply status this error surfaces as.
    pub fn status(&self) -> ReplyStatus {
        match self {
            CommError::NotConnected | CommError::Stopped => ReplyStatus::NotConnected,
            CommError::UntrackedObject { .. } => ReplyStatus::Exception,
            CommError::Status { status, .. } => *status,
            CommError::BadMessage { .. } | CommError::Json { .. } => ReplyStatus::BadMessage,
            CommError::Discovery { .. } => ReplyStatus::CommFailure,
            CommError::Timeout(_) => ReplyStatus::Timeout,
            CommError::InvalidEndpoint(_) | CommError::Config { .. } => ReplyStatus::CommFailure,
            CommError::Transport { .. } => ReplyStatus::HostUnreachable,
            CommError::Database { .. } => ReplyStatus::IoError,
            CommError::Other(_) => ReplyStatus::Exception,
        }
    }

    /// Check if retrying the operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommError::Timeout(_) | CommError::Transport { .. } | CommError::Discovery { .. }
        )
    }
}
