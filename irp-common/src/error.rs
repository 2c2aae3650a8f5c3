//! Common error types for the IR platform client

use thiserror::Error;

/// Common result type for IRP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared across IRP crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend payload could not be decoded
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
