//! SQL verification wrapper around sqlparser-rs

use crate::error::{Result, SqlError};
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Parses generated statements with the PostgreSQL dialect
pub struct SqlParser;

impl SqlParser {
    /// Parse exactly one statement
    pub fn parse(sql: &str) -> Result<Statement> {
        let dialect = PostgreSqlDialect {};
        let mut statements = Parser::parse_sql(&dialect, sql)?;

        match statements.len() {
            0 => Err(SqlError::Parse("Empty SQL statement".to_string())),
            1 => Ok(statements.remove(0)),
            _ => Err(SqlError::UnsupportedFeature(
                "Multiple statements not supported".to_string(),
            )),
        }
    }

    /// Parse and validate that the statement is a SELECT
    pub fn parse_select(sql: &str) -> Result<Statement> {
        let stmt = Self::parse(sql)?;

        match &stmt {
            Statement::Query(_) => Ok(stmt),
            _ => Err(SqlError::UnsupportedFeature(format!(
                "Only SELECT statements are generated, got: {}",
                stmt
            ))),
        }
    }
}
