//! VisitLens SQL - Query pushdown backend support
//!
//! Compiles a `ComputationConfig` into a typed plan and renders it as one
//! PostgreSQL aggregation query over a visits table. The same plan can be
//! evaluated directly by [`MemoryRelationalStore`], which is how the pushdown
//! path is checked against the in-process executor.
//!
//! # Example
//!
//! ```ignore
//! use visitlens_sql::{SqlTranslator, decode_rows};
//!
//! let compiled = SqlTranslator::new("visits").translate(&config, "opp-17")?;
//! let rows = store.execute(&compiled).await?;
//! let result_rows = decode_rows(&config, &rows)?;
//! ```

mod decode;
mod error;
mod eval;
mod expr;
mod functions;
mod parser;
mod render;
mod store;
mod translator;

pub use decode::decode_rows;
pub use error::{Result, SqlError};
pub use expr::{AggExpr, Column, CompareOp, Expr, Predicate, SqlType};
pub use functions::FunctionRegistry;
pub use parser::SqlParser;
pub use render::PostgresRenderer;
pub use store::{MemoryRelationalStore, RelationalStore, SqlValue, StoreRow};
pub use translator::{CompiledQuery, OutputColumn, PlanShape, QueryPlan, SqlTranslator};
