//! Error types for the Ratekeeper crate.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
///
/// A rejected request is not an error: it is reported through
/// [`Decision`](crate::ratelimit::Decision).
#[derive(Error, Debug)]
pub enum RateKeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The clock could not be read
    #[error("Clock error: {0}")]
    Clock(String),

    /// No client key could be derived from the request
    #[error("No client key in request: {0}")]
    MissingKey(String),

    /// Malformed request trace input
    #[error("Trace error on line {line}: {reason}")]
    Trace { line: usize, reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RateKeeperError>;
