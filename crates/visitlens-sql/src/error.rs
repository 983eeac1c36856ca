//! SQL-specific error types

use thiserror::Error;

/// Pushdown errors
#[derive(Debug, Error)]
pub enum SqlError {
    /// Generated SQL failed to parse
    #[error("SQL parse error: {0}")]
    Parse(String),

    /// Statement kind the pushdown path does not run
    #[error("Unsupported SQL feature: {0}")]
    UnsupportedFeature(String),

    /// Identifier that cannot be quoted safely
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Config cannot be compiled into a plan
    #[error("Translation error: {0}")]
    Translation(String),

    /// Relational store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Store row does not have the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Query error from the computation model
    #[error("Query error: {0}")]
    Query(#[from] visitlens_query::QueryError),
}

/// Result type for SQL operations
pub type Result<T> = std::result::Result<T, SqlError>;

impl From<sqlparser::parser::ParserError> for SqlError {
    fn from(e: sqlparser::parser::ParserError) -> Self {
        SqlError::Parse(e.to_string())
    }
}

impl From<visitlens_query::ConfigError> for SqlError {
    fn from(e: visitlens_query::ConfigError) -> Self {
        SqlError::Query(e.into())
    }
}
