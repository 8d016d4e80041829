use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MoltError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(#[from] toml::de::Error),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl MoltError {
    /// Stable error class surfaced to tool callers.
    pub fn code(&self) -> &'static str {
        match self {
            MoltError::NotFound(_) => "not_found",
            MoltError::ValidationError(_) | MoltError::ConfigError(_) => "validation",
            MoltError::Conflict(_) => "conflict",
            MoltError::RusqliteError(_)
            | MoltError::IoError(_)
            | MoltError::SerializationError(_)
            | MoltError::CompressionError(_) => "storage",
        }
    }
}
