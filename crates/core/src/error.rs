//! Core error types

use thiserror::Error;

/// Core error type for Aegis
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration is invalid or incomplete (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Alias kept for callers that refer to the core error generically.
pub type Error = CoreError;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
