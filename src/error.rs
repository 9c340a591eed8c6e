//! Error types for Bucketgate.

use thiserror::Error;

/// Main error type for Bucketgate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// No custom rate limit is registered for the given suffix
    #[error("Custom rate limit not found: {0}")]
    NotFound(String),

    /// A rate limit response header carried a value that could not be parsed
    #[error("Invalid {header} header {value:?}: {reason}")]
    HeaderParse {
        header: String,
        value: String,
        reason: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A response body could not be decoded
    #[error("Response body error: {0}")]
    Body(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    pub(crate) fn header_parse(
        header: impl Into<String>,
        value: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        GateError::HeaderParse {
            header: header.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for Bucketgate operations.
pub type Result<T> = std::result::Result<T, GateError>;
