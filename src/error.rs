//! Error types for the Floodgate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Invalid policy fields or inconsistent configuration values
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Handshake with a wrong or missing key
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Malformed frame or unknown command
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response within the RPC deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport failure or a permanently closed client
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server's counter store could not serve the call
    #[error("Counter store busy: {0}")]
    TransientStore(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FloodgateError {
    /// Whether the error means the limiter could not give an answer at all,
    /// as opposed to the caller doing something wrong.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            FloodgateError::Timeout(_)
                | FloodgateError::Connection(_)
                | FloodgateError::TransientStore(_)
                | FloodgateError::Io(_)
        )
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
