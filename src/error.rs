//! Error types for the global limiter.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The requested amount can never be granted by this limiter.
    #[error("Invalid amount {amount}: must be between 1 and {max_rate}")]
    InvalidAmount { amount: u64, max_rate: u64 },

    /// The caller's deadline elapsed while waiting for capacity.
    #[error("Timed out after waiting {waited:?} for capacity")]
    Timeout { waited: Duration },

    /// The window store could not be reached or the script failed.
    #[error("Window store unavailable: {0}")]
    StoreUnavailable(String),

    /// The caller cancelled the acquisition during a wait.
    #[error("Acquisition cancelled")]
    Cancelled,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for LimiterError {
    fn from(err: StoreError) -> Self {
        LimiterError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for LimiterError {
    fn from(err: config::ConfigError) -> Self {
        LimiterError::Config(err.to_string())
    }
}

impl LimiterError {
    /// Whether the scheduler may retry the operation after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, LimiterError::StoreUnavailable(_))
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
