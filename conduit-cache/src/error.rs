//! Error types for cache operations.

use conduit_core::BusError;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Key pattern could not be compiled
    #[error("Invalid key pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Backend unreachable or failing
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// Operation timeout
    #[error("Operation timeout")]
    Timeout,
}

impl From<CacheError> for BusError {
    fn from(err: CacheError) -> Self {
        BusError::Internal(err.to_string())
    }
}
