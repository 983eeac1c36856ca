//! VisitLens Query - Computation configs and the in-process engine
//!
//! This crate provides:
//! - The declarative computation config (fields, histograms, filters, stage)
//! - Validation at construction and a stable config fingerprint
//! - The aggregation engine (nine aggregation kinds)
//! - The histogram engine (fixed-width bins and sparklines)
//! - The in-process executor producing per-visit or per-worker rows

pub mod aggregation;
pub mod error;
pub mod executor;
pub mod histogram;
pub mod model;
pub mod result;

pub use aggregation::{aggregate, aggregate_with_default, finalize, AggregationKind, Aggregator};
pub use error::{ConfigError, QueryError, Result};
pub use executor::{Executor, DEFAULT_GROUP_THRESHOLD};
pub use histogram::{bin, bin_index, sparkline, HistogramResult};
pub use model::{
    ComputationConfig, ComputationConfigBuilder, FieldComputation, HistogramComputation,
    TerminalStage, VisitFilters, RESERVED_NAMES,
};
pub use result::{status_class, AnalysisResult, FlwRow, ResultRows, StatusClass, VisitRow};
