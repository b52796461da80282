//! Error types for the rate store.

use thiserror::Error;

/// Main error type for rate store operations.
#[derive(Error, Debug)]
pub enum RateStoreError {
    /// The key's current window has no capacity left
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// The store was closed before the call
    #[error("rate store is closed")]
    StoreClosed,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateStoreError {
    /// Whether this error means the caller should back off.
    ///
    /// Middleware typically maps this to a "too many requests" response and
    /// everything else to an internal error.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RateStoreError::RateLimitExceeded)
    }
}

/// Result type alias for rate store operations.
pub type Result<T> = std::result::Result<T, RateStoreError>;
