//! Error types for a11y-progress-core

use thiserror::Error;

/// Main error type for the a11y-progress-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Inbound message could not be decoded into a server message
    #[error("decode error: {0}")]
    Decode(String),

    /// Progress channel transport error
    #[error("channel error: {0}")]
    Channel(String),

    /// REST API error
    #[error("API error: {0}")]
    Api(String),
}

/// Result type alias for a11y-progress-core
pub type Result<T> = std::result::Result<T, Error>;
