//! VisitLens Engine - Analysis over field visit datasets
//!
//! This crate ties the pipeline together:
//! - Record source trait with timeout and cancellation
//! - In-process and query pushdown backends behind one trait
//! - Sampling filter for downstream review
//! - YAML settings and logging setup

pub mod backend;
pub mod engine;
pub mod error;
pub mod in_process;
pub mod logging;
pub mod pushdown;
pub mod sampling;
pub mod settings;
pub mod source;

pub use backend::{AnalysisBackend, BackendKind, FetchedVisits, RawFetchRequest, RawVisitLoader};
pub use engine::{AnalysisEngine, AnalysisOutcome, AnalysisRequest};
pub use error::{EngineError, Result};
pub use in_process::InProcessBackend;
pub use logging::init_logging;
pub use pushdown::PushdownBackend;
pub use sampling::{SampleSelection, SamplingCriteria};
pub use settings::{
    CacheSettings, EngineSettings, FetchSettings, LoggingSettings, ParallelSettings, PushdownSettings,
};
pub use source::{fetch_with_timeout, with_deadline, Credentials, FetchRequest, RecordSource, StaticRecordSource};
