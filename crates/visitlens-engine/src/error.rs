//! Engine error types

use thiserror::Error;
use visitlens_cache::CacheError;
use visitlens_core::CoreError;
use visitlens_query::{ConfigError, QueryError};
use visitlens_sql::SqlError;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Record error: {0}")]
    Record(#[from] CoreError),

    #[error("Pushdown error: {0}")]
    Sql(#[from] SqlError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// The record source did not answer within the fetch timeout
    #[error("Fetch of dataset '{dataset_id}' timed out after {timeout_ms} ms")]
    FetchTimeout { dataset_id: String, timeout_ms: u64 },

    #[error("Fetch of dataset '{0}' was cancelled")]
    FetchCancelled(String),

    /// Connectivity failure talking to the record source
    #[error("Record source unavailable: {0}")]
    SourceUnavailable(String),

    /// The record source refused the request
    #[error("Record source rejected request: {0}")]
    SourceRejected(String),

    #[error("Dataset '{0}' has no cached raw visits")]
    RawNotCached(String),

    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    #[error("Computation task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::FetchTimeout { .. } | EngineError::SourceUnavailable(_)
        )
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = EngineError::FetchTimeout {
            dataset_id: "d".into(),
            timeout_ms: 10,
        };
        assert!(timeout.is_retryable());
        assert!(EngineError::SourceUnavailable("reset".into()).is_retryable());
        assert!(!EngineError::SourceRejected("bad token".into()).is_retryable());
        assert!(!EngineError::Config(ConfigError::EmptyGroupingKey).is_retryable());
        assert!(!EngineError::FetchCancelled("d".into()).is_retryable());
    }
}
