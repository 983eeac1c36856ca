//! Query error types

use thiserror::Error;

/// Invalid computation configs. Raised at construction, never at compute time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Computation name must not be empty")]
    EmptyName,

    #[error("Computation '{0}' has no extraction paths")]
    EmptyPaths(String),

    #[error("Computation '{name}' has an empty segment in path '{path}'")]
    EmptyPathSegment { name: String, path: String },

    #[error("Unknown aggregation: {0}")]
    UnknownAggregation(String),

    #[error("Unknown terminal stage: {0}")]
    UnknownTerminalStage(String),

    #[error("Unknown transform: {0}")]
    UnknownTransform(String),

    #[error("Histogram '{name}' has inverted bounds: lower {lower} >= upper {upper}")]
    InvertedBounds { name: String, lower: f64, upper: f64 },

    #[error("Histogram '{0}' has non-finite bounds")]
    NonFiniteBounds(String),

    #[error("Histogram '{0}' needs at least one bin")]
    ZeroBins(String),

    #[error("Duplicate output name: {0}")]
    DuplicateName(String),

    #[error("Output name '{0}' is reserved for a standard column")]
    ReservedName(String),

    #[error("Grouping key must not be empty")]
    EmptyGroupingKey,

    #[error("Invalid date filter: from {from} is after to {to}")]
    InvertedDateRange { from: String, to: String },

    #[error("Config parse error: {0}")]
    Parse(String),
}

/// Query errors
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record error: {0}")]
    Record(String),

    #[error("Computation cancelled")]
    Cancelled,
}

/// Result type for query operations
pub type Result<T> = std::result::Result<T, QueryError>;

impl From<visitlens_core::CoreError> for QueryError {
    fn from(e: visitlens_core::CoreError) -> Self {
        QueryError::Record(e.to_string())
    }
}
