//! Shared error type for configuration and other cross-crate concerns

use thiserror::Error;

/// Errors that can occur in the shared library
#[derive(Debug, Error)]
pub enum Error {
    /// IO errors from file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (missing file, parse failure, invalid value)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias using our error type
pub type Result<T> = std::result::Result<T, Error>;
