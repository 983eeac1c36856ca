//! Cache error types

use thiserror::Error;

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored bytes do not decode as an entry of the expected tier
    #[error("Corrupt cache entry '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Cache store error: {0}")]
    Store(String),

    #[error("Invalid cache key component: {0}")]
    InvalidKey(String),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<bincode::Error> for CacheError {
    fn from(e: bincode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
