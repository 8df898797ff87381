//! Error types shared across meterflow crates

use thiserror::Error;

/// Result type alias for meterflow operations
pub type Result<T> = std::result::Result<T, MeterflowError>;

/// Errors that are not specific to one pipeline stage
#[derive(Error, Debug)]
pub enum MeterflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid ISO week: {0}")]
    InvalidWeek(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
