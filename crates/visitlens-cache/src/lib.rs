//! VisitLens Cache - Result cache shared by both execution backends
//!
//! Three independently invalidated tiers per dataset:
//! - raw visit batches, keyed by fetch mode
//! - visit-level results, keyed by config hash
//! - aggregated (per-worker) results, keyed by config hash
//!
//! Keys never name the backend that produced an entry, so a dataset can switch
//! backends without invalidating anything.

mod entry;
mod error;
mod keys;
mod manager;
mod store;

pub use entry::{validate, CacheEntry};
pub use error::{CacheError, Result};
pub use keys::{CacheKey, CacheTier, DEFAULT_KEY_PREFIX};
pub use manager::{CacheConfig, CacheManager, CacheReport, CacheReportEntry, EvictionCounts};
pub use store::{CacheStore, MemoryCacheStore};
