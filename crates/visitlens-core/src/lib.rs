//! VisitLens Core - Core types for the visit analysis engine
//!
//! This crate provides the fundamental pieces shared by both execution backends:
//! - `FieldValue`: Typed values extracted from visit payloads
//! - `SlimVisit` / `VisitRecord`: Parsed raw visit records (slim and full)
//! - `RawVisitBatch`: Immutable raw record bytes as fetched from the record source
//! - Path extraction over nested payload documents
//! - The closed set of named value transforms and their shared thresholds

pub mod error;
pub mod extract;
pub mod record;
pub mod transform;
pub mod types;

pub use error::{CoreError, Result};
pub use extract::{extract, extract_multi, extract_value};
pub use record::{ParsedVisits, RawVisitBatch, SlimVisit, VisitRecord};
pub use transform::{Transform, TransformRegistry};
pub use types::*;
