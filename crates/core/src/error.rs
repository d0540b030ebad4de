//! Core error types

use thiserror::Error;

/// Core error type for Pidgeon
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration value out of range or inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
