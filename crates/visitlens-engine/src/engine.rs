//! Analysis engine
//!
//! Request flow for one computation:
//!
//! 1. Ask the record source for the current record count
//! 2. Look up a cached result valid for that count
//! 3. On a miss, fetch raw visits (raw tier honoured unless refreshing)
//! 4. Compute with the selected backend and cache the result
//!
//! Both backends share one cache manager, so switching backend between
//! requests needs no migration.

use crate::backend::{AnalysisBackend, BackendKind, RawFetchRequest, RawVisitLoader};
use crate::error::{EngineError, Result};
use crate::in_process::InProcessBackend;
use crate::pushdown::PushdownBackend;
use crate::sampling::{SampleSelection, SamplingCriteria};
use crate::settings::EngineSettings;
use crate::source::{with_deadline, Credentials, RecordSource};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use visitlens_cache::{CacheManager, CacheReport, CacheStore, CacheTier, EvictionCounts};
use visitlens_query::{AnalysisResult, ComputationConfig};
use visitlens_sql::RelationalStore;

/// One analysis request
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub dataset_id: String,
    pub credentials: Credentials,
    pub config: ComputationConfig,
    /// Overrides the configured backend
    pub backend: Option<BackendKind>,
    /// Skip both cache lookups and refetch raw visits
    pub force_refresh: bool,
    /// Overrides the configured tolerance window
    pub tolerance_minutes: Option<u64>,
    /// Consult the result cache; results are stored either way
    pub use_cache: bool,
}

impl AnalysisRequest {
    pub fn new(dataset_id: impl Into<String>, credentials: Credentials, config: ComputationConfig) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            credentials,
            config,
            backend: None,
            force_refresh: false,
            tolerance_minutes: None,
            use_cache: true,
        }
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = Some(kind);
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn tolerance_minutes(mut self, minutes: u64) -> Self {
        self.tolerance_minutes = Some(minutes);
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }
}

/// A result plus how it was obtained
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub result: AnalysisResult,
    pub cache_hit: bool,
    pub backend: BackendKind,
    /// Whether raw visits came from the raw tier; `None` on a result hit
    pub raw_from_cache: Option<bool>,
}

/// Entry point tying the record source, cache and backends together
pub struct AnalysisEngine {
    settings: EngineSettings,
    source: Arc<dyn RecordSource>,
    cache: Arc<CacheManager>,
    store: Option<Arc<dyn RelationalStore>>,
    fetch_timeout: Duration,
    cancel: CancellationToken,
    in_process: InProcessBackend,
    pushdown: Option<PushdownBackend>,
}

impl AnalysisEngine {
    pub fn new(settings: EngineSettings, source: Arc<dyn RecordSource>, store: Arc<dyn CacheStore>) -> Self {
        let cache = Arc::new(CacheManager::new(store, settings.to_cache_config()));
        let fetch_timeout = settings.fetch_timeout();
        let cancel = CancellationToken::new();
        let loader = RawVisitLoader::new(source.clone(), cache.clone(), fetch_timeout, cancel.clone());
        let in_process = InProcessBackend::new(loader, settings.parallel.group_threshold, cancel.clone());
        Self {
            settings,
            source,
            cache,
            store: None,
            fetch_timeout,
            cancel,
            in_process,
            pushdown: None,
        }
    }

    /// Enable the pushdown backend on a relational store
    pub fn with_relational_store(mut self, store: Arc<dyn RelationalStore>) -> Self {
        self.store = Some(store);
        self.rebuild_backends();
        self
    }

    /// Override the fetch timeout from the settings
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self.rebuild_backends();
        self
    }

    fn rebuild_backends(&mut self) {
        let loader = RawVisitLoader::new(
            self.source.clone(),
            self.cache.clone(),
            self.fetch_timeout,
            self.cancel.clone(),
        );
        self.in_process = InProcessBackend::new(
            loader.clone(),
            self.settings.parallel.group_threshold,
            self.cancel.clone(),
        );
        self.pushdown = self
            .store
            .clone()
            .map(|store| PushdownBackend::new(loader, store, &self.settings.pushdown));
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Token cancelling every in-flight fetch and computation
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Backend for a kind, if available
    pub fn backend(&self, kind: BackendKind) -> Result<&dyn AnalysisBackend> {
        match kind {
            BackendKind::InProcess => Ok(&self.in_process),
            BackendKind::Pushdown => self
                .pushdown
                .as_ref()
                .map(|b| b as &dyn AnalysisBackend)
                .ok_or_else(|| EngineError::BackendUnavailable("pushdown requires a relational store".to_string())),
        }
    }

    /// Current record count, under the fetch timeout
    pub async fn record_count(&self, dataset_id: &str, credentials: &Credentials) -> Result<u64> {
        with_deadline(
            dataset_id,
            self.fetch_timeout,
            &self.cancel,
            self.source.record_count(dataset_id, credentials),
        )
        .await
    }

    /// Run one analysis request
    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisOutcome> {
        let start = Instant::now();
        request.config.validate()?;

        let kind = request.backend.unwrap_or(self.settings.backend);
        let backend = self.backend(kind)?;
        let dataset_id = request.dataset_id.as_str();
        debug!(dataset = dataset_id, backend = %kind, "backend selected");

        let current_count = self.record_count(dataset_id, &request.credentials).await?;
        let tier = CacheTier::for_stage(request.config.terminal_stage);

        if request.use_cache && !request.force_refresh {
            let tolerance = self.tolerance(request);
            if let Some(result) =
                backend.get_cached_result(dataset_id, &request.config, current_count, tier, tolerance)?
            {
                info!(
                    dataset = dataset_id,
                    config_hash = %result.config_hash,
                    backend = %kind,
                    "analysis served from cache"
                );
                return Ok(AnalysisOutcome {
                    result,
                    cache_hit: true,
                    backend: kind,
                    raw_from_cache: None,
                });
            }
        }

        let mut fetch = RawFetchRequest::new(dataset_id, request.credentials.clone());
        fetch.expected_count = Some(current_count);
        fetch.force_refresh = request.force_refresh;
        let fetched = backend.fetch_raw_visits(&fetch).await?;

        let result = backend
            .compute_and_cache(&request.config, dataset_id, &fetched.batch, current_count)
            .await?;
        info!(
            dataset = dataset_id,
            config_hash = %result.config_hash,
            backend = %kind,
            record_count = current_count,
            excluded = result.excluded_records,
            raw_from_cache = fetched.from_cache,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "analysis computed"
        );
        Ok(AnalysisOutcome {
            result,
            cache_hit: false,
            backend: kind,
            raw_from_cache: Some(fetched.from_cache),
        })
    }

    fn tolerance(&self, request: &AnalysisRequest) -> Option<chrono::Duration> {
        match request.tolerance_minutes {
            Some(minutes) => chrono::Duration::try_minutes(minutes as i64),
            None => self.settings.tolerance(),
        }
    }

    /// Select visit ids for sampling.
    ///
    /// Uses the cached raw visits, fetching a slim batch first when nothing
    /// is cached for the dataset.
    pub async fn sample(
        &self,
        dataset_id: &str,
        credentials: &Credentials,
        criteria: &SamplingCriteria,
        kind: Option<BackendKind>,
    ) -> Result<SampleSelection> {
        let backend = self.backend(kind.unwrap_or(self.settings.backend))?;
        match backend.filter_for_sampling(dataset_id, criteria).await {
            Err(EngineError::RawNotCached(_)) => {
                let mut fetch = RawFetchRequest::new(dataset_id, credentials.clone());
                fetch.slim = true;
                backend.fetch_raw_visits(&fetch).await?;
                backend.filter_for_sampling(dataset_id, criteria).await
            }
            other => other,
        }
    }

    /// Evict a dataset, or one config's results.
    ///
    /// A full eviction also drops the dataset from the relational store.
    pub async fn evict_cache(&self, dataset_id: &str, config_hash: Option<&str>) -> Result<EvictionCounts> {
        let counts = match &self.pushdown {
            Some(pushdown) => pushdown.evict_cache(dataset_id, config_hash).await?,
            None => self.in_process.evict_cache(dataset_id, config_hash).await?,
        };
        info!(
            dataset = dataset_id,
            config_hash = config_hash.unwrap_or("*"),
            evicted = counts.total(),
            "cache evicted"
        );
        Ok(counts)
    }

    pub fn cache_report(&self, dataset_id: &str) -> Result<CacheReport> {
        self.in_process.cache_report(dataset_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticRecordSource;
    use visitlens_cache::MemoryCacheStore;

    fn engine() -> AnalysisEngine {
        AnalysisEngine::new(
            EngineSettings::default(),
            Arc::new(StaticRecordSource::new()),
            Arc::new(MemoryCacheStore::new()),
        )
    }

    #[test]
    fn test_pushdown_needs_store() {
        let engine = engine();
        assert!(engine.backend(BackendKind::InProcess).is_ok());
        assert!(matches!(
            engine.backend(BackendKind::Pushdown),
            Err(EngineError::BackendUnavailable(_))
        ));
        let engine = engine.with_relational_store(Arc::new(visitlens_sql::MemoryRelationalStore::new()));
        assert_eq!(engine.backend(BackendKind::Pushdown).unwrap().kind(), BackendKind::Pushdown);
    }

    #[test]
    fn test_request_tolerance_overrides_settings() {
        let mut settings = EngineSettings::default();
        settings.cache.tolerance_minutes = Some(30);
        let engine = AnalysisEngine::new(
            settings,
            Arc::new(StaticRecordSource::new()),
            Arc::new(MemoryCacheStore::new()),
        );
        let config = ComputationConfig::builder("username").build().unwrap();
        let request = AnalysisRequest::new("d", Credentials::default(), config);
        assert_eq!(engine.tolerance(&request), Some(chrono::Duration::minutes(30)));
        assert_eq!(
            engine.tolerance(&request.tolerance_minutes(5)),
            Some(chrono::Duration::minutes(5))
        );
    }
}
