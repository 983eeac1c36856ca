//! Error types for visitlens-core

use thiserror::Error;

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Malformed record batch: {0}")]
    MalformedBatch(String),

    #[error("Batch was fetched in slim mode and carries no payload")]
    SlimBatch,

    #[error("Unknown transform: {0}")]
    UnknownTransform(String),

    #[error("Transform alias '{alias}' already bound to {existing}")]
    AliasConflict { alias: String, existing: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
