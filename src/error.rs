//! Error types for the Bulwark engine.

use thiserror::Error;

/// Main error type for Bulwark operations.
///
/// A rate-limit denial is not an error: it is returned as a
/// [`Decision`](crate::ratelimit::Decision) with `allowed == false`.
#[derive(Error, Debug)]
pub enum BulwarkError {
    /// The operation has no registered policy and no override was supplied
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// A policy with a zero ceiling or zero window
    #[error("Invalid policy for {operation}: {reason}")]
    InvalidPolicy { operation: String, reason: String },

    /// Snapshot data that cannot be imported
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BulwarkError {
    pub(crate) fn invalid_policy(operation: &str, reason: impl Into<String>) -> Self {
        BulwarkError::InvalidPolicy {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;
