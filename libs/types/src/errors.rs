//! Error types shared across the pipeline
//!
//! Validation failures are per-tick: a malformed entry is skipped and
//! counted, the rest of the batch proceeds.

use thiserror::Error;

/// Reasons an inbound tick is refused before it reaches the dedup gate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing symbol")]
    MissingSymbol,

    #[error("Missing price")]
    MissingPrice,

    #[error("Invalid price: {0}")]
    InvalidPrice(f64),

    #[error("Missing timestamp")]
    MissingTimestamp,

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(f64),

    #[error("Malformed tick payload: {0}")]
    Malformed(String),
}

impl ValidationError {
    /// Short label used as a structured log field.
    pub fn label(&self) -> &'static str {
        match self {
            ValidationError::MissingSymbol => "missing_symbol",
            ValidationError::MissingPrice => "missing_price",
            ValidationError::InvalidPrice(_) => "invalid_price",
            ValidationError::MissingTimestamp => "missing_ts",
            ValidationError::InvalidTimestamp(_) => "invalid_ts",
            ValidationError::InvalidVolume(_) => "invalid_volume",
            ValidationError::Malformed(_) => "malformed",
        }
    }
}
