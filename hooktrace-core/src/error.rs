//! Error types for hooktrace-core

use thiserror::Error;

/// Main error type for the hooktrace-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Trace log error
    #[error("trace log error: {0}")]
    TraceLog(String),
}

/// Result type alias for hooktrace-core
pub type Result<T> = std::result::Result<T, Error>;
