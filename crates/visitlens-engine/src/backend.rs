//! Backend capability interface
//!
//! Both execution strategies implement [`AnalysisBackend`]. They share the
//! same cache manager, and cache keys carry no backend identity, so a result
//! computed by one backend is a hit for the other.

use crate::error::{EngineError, Result};
use crate::sampling::{SampleSelection, SamplingCriteria};
use crate::source::{fetch_with_timeout, Credentials, FetchRequest, RecordSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use visitlens_cache::{CacheManager, CacheReport, CacheTier, EvictionCounts};
use visitlens_core::RawVisitBatch;
use visitlens_query::{AnalysisResult, ComputationConfig};

/// Execution strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Iterate materialized records in this process
    #[default]
    InProcess,
    /// Compile to one query run by a relational store
    Pushdown,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::InProcess => "in_process",
            BackendKind::Pushdown => "pushdown",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "in_process" | "inprocess" | "python" | "local" => Ok(BackendKind::InProcess),
            "pushdown" | "sql" => Ok(BackendKind::Pushdown),
            _ => Err(EngineError::BackendUnavailable(s.to_string())),
        }
    }
}

/// Raw visit fetch
#[derive(Debug, Clone)]
pub struct RawFetchRequest {
    pub dataset_id: String,
    pub credentials: Credentials,
    /// Record count a cached batch must match; `None` accepts any cached batch
    pub expected_count: Option<u64>,
    pub force_refresh: bool,
    pub slim: bool,
    pub id_filter: Option<Vec<String>>,
}

impl RawFetchRequest {
    pub fn new(dataset_id: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            credentials,
            expected_count: None,
            force_refresh: false,
            slim: false,
            id_filter: None,
        }
    }
}

/// A raw batch and where it came from
#[derive(Debug, Clone)]
pub struct FetchedVisits {
    pub batch: RawVisitBatch,
    pub from_cache: bool,
}

/// Capability interface of an execution backend
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Raw visits, from the raw tier when valid, else from the record source
    async fn fetch_raw_visits(&self, request: &RawFetchRequest) -> Result<FetchedVisits>;

    /// True when a full raw batch is cached for `expected_count`
    fn has_valid_raw_cache(&self, dataset_id: &str, expected_count: u64) -> Result<bool>;

    /// Cached result valid for `current_count`
    fn get_cached_result(
        &self,
        dataset_id: &str,
        config: &ComputationConfig,
        current_count: u64,
        tier: CacheTier,
        tolerance: Option<chrono::Duration>,
    ) -> Result<Option<AnalysisResult>>;

    /// Compute over a raw batch and store the result
    async fn compute_and_cache(
        &self,
        config: &ComputationConfig,
        dataset_id: &str,
        batch: &RawVisitBatch,
        record_count: u64,
    ) -> Result<AnalysisResult>;

    /// Visit ids matching sampling criteria, over the cached raw visits
    async fn filter_for_sampling(
        &self,
        dataset_id: &str,
        criteria: &SamplingCriteria,
    ) -> Result<SampleSelection>;

    /// Evict a dataset, or one config's results
    async fn evict_cache(&self, dataset_id: &str, config_hash: Option<&str>) -> Result<EvictionCounts>;

    fn cache_report(&self, dataset_id: &str) -> Result<CacheReport>;
}

/// Raw-tier access shared by both backends
#[derive(Clone)]
pub struct RawVisitLoader {
    source: Arc<dyn RecordSource>,
    cache: Arc<CacheManager>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl RawVisitLoader {
    pub fn new(
        source: Arc<dyn RecordSource>,
        cache: Arc<CacheManager>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            cache,
            timeout,
            cancel,
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Fetch honouring the raw tier.
    ///
    /// Id-filtered fetches are cut from a valid cached batch when there is one
    /// and are never cached themselves.
    pub async fn load(&self, request: &RawFetchRequest) -> Result<FetchedVisits> {
        let dataset_id = request.dataset_id.as_str();

        if !request.force_refresh {
            if let Some(entry) = self.cache.get_raw(dataset_id, request.slim)? {
                let fresh = request.expected_count.is_none()
                    || request.expected_count == Some(entry.record_count);
                if fresh {
                    debug!(dataset = dataset_id, slim = request.slim, "raw cache hit");
                    let batch = match &request.id_filter {
                        Some(ids) => {
                            let ids: HashSet<String> = ids.iter().cloned().collect();
                            entry.payload.retain_ids(&ids)?
                        }
                        None => entry.payload,
                    };
                    return Ok(FetchedVisits {
                        batch,
                        from_cache: true,
                    });
                }
                debug!(
                    dataset = dataset_id,
                    cached_count = entry.record_count,
                    expected = request.expected_count,
                    "raw cache stale"
                );
            }
        }

        let fetch = FetchRequest {
            dataset_id: dataset_id.to_string(),
            credentials: request.credentials.clone(),
            slim: request.slim,
            id_filter: request.id_filter.clone(),
        };
        let batch = fetch_with_timeout(self.source.as_ref(), &fetch, self.timeout, &self.cancel).await?;

        if request.id_filter.is_none() {
            let count = match request.expected_count {
                Some(count) => count,
                None => batch.record_count()? as u64,
            };
            if let Err(e) = self.cache.put_raw(dataset_id, &batch, count) {
                // A failed cache write costs a refetch, not the request
                warn!(dataset = dataset_id, error = %e, "raw batch not cached");
            }
        }

        Ok(FetchedVisits {
            batch,
            from_cache: false,
        })
    }

    pub fn has_valid(&self, dataset_id: &str, expected_count: u64) -> Result<bool> {
        Ok(self.cache.has_valid_raw(dataset_id, expected_count, false, None)?)
    }

    /// Cached batch for sampling; slim suffices
    pub fn cached_for_sampling(&self, dataset_id: &str) -> Result<RawVisitBatch> {
        self.cache
            .get_raw(dataset_id, true)?
            .map(|entry| entry.payload)
            .ok_or_else(|| EngineError::RawNotCached(dataset_id.to_string()))
    }
}
