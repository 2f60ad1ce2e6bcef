//! Error types for the Slidegate limiter.

use thiserror::Error;

use crate::ratelimit::Timestamp;

/// Main error type for Slidegate operations.
#[derive(Error, Debug)]
pub enum SlidegateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A key's clock went backwards while the reject policy is active
    #[error("Out-of-order timestamp {timestamp}: key already observed {latest}")]
    OutOfOrder {
        timestamp: Timestamp,
        latest: Timestamp,
    },

    /// Malformed replay trace input
    #[error("Trace error on line {line}: {reason}")]
    Trace { line: usize, reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Slidegate operations.
pub type Result<T> = std::result::Result<T, SlidegateError>;
