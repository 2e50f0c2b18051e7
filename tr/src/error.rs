//! Relay error types

use thiserror::Error;

use crate::session::SessionError;

/// Errors surfaced by the coordination layer
///
/// Every variant is rendered by the facade as an `{"error": <message>}`
/// envelope, except rejections which become an "unsubscribe" action.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Node \"{0}\" is not registered")]
    NotRegistered(String),

    #[error("Application \"{0}\" was not found")]
    NotFound(String),

    #[error("Node rejected: {0}")]
    NodeRejected(String),

    #[error("Invalid result: {0}")]
    InvalidResult(String),

    #[error("Application \"{0}\" has been completed")]
    ApplicationCompleted(String),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Session data error: {0}")]
    Session(#[from] SessionError),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate
pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// Check if the node should be told to unsubscribe instead of seeing an error
    pub fn is_rejection(&self) -> bool {
        matches!(self, RelayError::NodeRejected(_) | RelayError::ApplicationCompleted(_))
    }

    /// Check if this error invalidates the submitted result
    pub fn is_invalid_result(&self) -> bool {
        matches!(self, RelayError::InvalidResult(_) | RelayError::MalformedInput(_))
    }
}
