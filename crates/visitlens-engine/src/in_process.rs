//! In-process backend
//!
//! Parses raw batches and runs the executor pipeline on a blocking thread.

use crate::backend::{AnalysisBackend, BackendKind, FetchedVisits, RawFetchRequest, RawVisitLoader};
use crate::error::Result;
use crate::sampling::{filter_and_select, SampleSelection, SamplingCriteria};
use async_trait::async_trait;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use visitlens_cache::{CacheReport, CacheTier, EvictionCounts};
use visitlens_core::RawVisitBatch;
use visitlens_query::{AnalysisResult, ComputationConfig, Executor};

/// Backend that computes over materialized records
pub struct InProcessBackend {
    loader: RawVisitLoader,
    executor: Executor,
    cancel: CancellationToken,
}

impl InProcessBackend {
    pub fn new(loader: RawVisitLoader, group_threshold: usize, cancel: CancellationToken) -> Self {
        Self {
            loader,
            executor: Executor::new().with_group_threshold(group_threshold),
            cancel,
        }
    }
}

#[async_trait]
impl AnalysisBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn fetch_raw_visits(&self, request: &RawFetchRequest) -> Result<FetchedVisits> {
        self.loader.load(request).await
    }

    fn has_valid_raw_cache(&self, dataset_id: &str, expected_count: u64) -> Result<bool> {
        self.loader.has_valid(dataset_id, expected_count)
    }

    fn get_cached_result(
        &self,
        dataset_id: &str,
        config: &ComputationConfig,
        current_count: u64,
        tier: CacheTier,
        tolerance: Option<chrono::Duration>,
    ) -> Result<Option<AnalysisResult>> {
        Ok(self.loader.cache().get_valid_result(
            dataset_id,
            &config.config_hash(),
            tier,
            current_count,
            tolerance,
        )?)
    }

    async fn compute_and_cache(
        &self,
        config: &ComputationConfig,
        dataset_id: &str,
        batch: &RawVisitBatch,
        record_count: u64,
    ) -> Result<AnalysisResult> {
        let start = Instant::now();
        let parsed = batch.parse_full()?;
        if parsed.excluded > 0 {
            warn!(
                dataset = dataset_id,
                excluded = parsed.excluded,
                "records failed to parse and were excluded"
            );
        }

        let executor = self.executor.clone();
        let task_config = config.clone();
        let cancel = self.cancel.child_token();
        let records = parsed.records;
        let rows = tokio::task::spawn_blocking(move || {
            executor.execute_with_cancellation(&task_config, &records, cancel)
        })
        .await??;

        let result = AnalysisResult::new(dataset_id, config, record_count, parsed.excluded as u64, rows);
        self.loader.cache().put_result(&result)?;
        info!(
            dataset = dataset_id,
            config_hash = %result.config_hash,
            rows = result.rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "in-process computation complete"
        );
        Ok(result)
    }

    async fn filter_for_sampling(
        &self,
        dataset_id: &str,
        criteria: &SamplingCriteria,
    ) -> Result<SampleSelection> {
        criteria.validate()?;
        let batch = self.loader.cached_for_sampling(dataset_id)?;
        let parsed = batch.parse_slim()?;
        Ok(filter_and_select(dataset_id, parsed.records, criteria))
    }

    async fn evict_cache(&self, dataset_id: &str, config_hash: Option<&str>) -> Result<EvictionCounts> {
        Ok(self.loader.cache().evict(dataset_id, config_hash)?)
    }

    fn cache_report(&self, dataset_id: &str) -> Result<CacheReport> {
        Ok(self.loader.cache().report(dataset_id)?)
    }
}

impl std::fmt::Debug for InProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBackend")
            .field("executor", &self.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Credentials, StaticRecordSource};
    use std::sync::Arc;
    use std::time::Duration;
    use visitlens_cache::{CacheManager, MemoryCacheStore};
    use visitlens_core::FieldValue;

    const DATA: &str = r#"[
        {"id": 1, "username": "amina", "status": "approved", "visit_date": "2024-05-01T08:00:00Z",
         "form_json": {"form": {"age": 10}}},
        {"id": 2, "username": "amina", "status": "approved", "visit_date": "2024-05-02T08:00:00Z",
         "form_json": {"form": {}}},
        {"id": 3, "username": "amina", "status": "pending", "visit_date": "2024-05-03T08:00:00Z",
         "form_json": {"form": {"age": 20}}},
        {"id": 4, "status": "approved", "visit_date": "not a date"}
    ]"#;

    fn backend() -> InProcessBackend {
        let source = Arc::new(StaticRecordSource::new());
        source.insert_raw("d", DATA).unwrap();
        let cache = Arc::new(CacheManager::with_defaults(Arc::new(MemoryCacheStore::new())));
        let cancel = CancellationToken::new();
        let loader = RawVisitLoader::new(source, cache, Duration::from_secs(5), cancel.clone());
        InProcessBackend::new(loader, 4, cancel)
    }

    fn config() -> ComputationConfig {
        ComputationConfig::from_json(
            r#"{"grouping_key": "username",
                "fields": [{"name": "avg_age", "path": "form.age", "aggregation": "avg"}]}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_compute_counts_exclusions_and_caches() {
        let backend = backend();
        let fetched = backend
            .fetch_raw_visits(&RawFetchRequest::new("d", Credentials::default()))
            .await
            .unwrap();
        let result = backend.compute_and_cache(&config(), "d", &fetched.batch, 4).await.unwrap();

        assert_eq!(result.excluded_records, 1);
        assert_eq!(result.worker("amina").unwrap().custom_fields["avg_age"], Some(FieldValue::Float(15.0)));

        let cached = backend
            .get_cached_result("d", &config(), 4, CacheTier::WorkerResults, None)
            .unwrap();
        assert_eq!(cached, Some(result));
    }

    #[tokio::test]
    async fn test_cancelled_computation_fails() {
        let backend = backend();
        let fetched = backend
            .fetch_raw_visits(&RawFetchRequest::new("d", Credentials::default()))
            .await
            .unwrap();
        backend.cancel.cancel();
        assert!(backend.compute_and_cache(&config(), "d", &fetched.batch, 4).await.is_err());
        assert!(backend.cache_report("d").unwrap().tier(CacheTier::WorkerResults).next().is_none());
    }
}
