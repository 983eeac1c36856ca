//! Query pushdown backend
//!
//! Loads parsed visits into a relational store, compiles each config to one
//! query and decodes the returned rows into the shared result shapes.

use crate::backend::{AnalysisBackend, BackendKind, FetchedVisits, RawFetchRequest, RawVisitLoader};
use crate::error::Result;
use crate::sampling::{filter_and_select, select, SampleSelection, SamplingCriteria};
use crate::settings::PushdownSettings;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use visitlens_cache::{CacheReport, CacheTier, EvictionCounts};
use visitlens_core::{RawVisitBatch, SlimVisit};
use visitlens_query::{AnalysisResult, ComputationConfig, TerminalStage, VisitRow};
use visitlens_sql::{decode_rows, RelationalStore, SqlTranslator};

/// Backend that runs generated queries on a relational store
pub struct PushdownBackend {
    loader: RawVisitLoader,
    store: Arc<dyn RelationalStore>,
    translator: SqlTranslator,
}

impl PushdownBackend {
    pub fn new(loader: RawVisitLoader, store: Arc<dyn RelationalStore>, settings: &PushdownSettings) -> Self {
        Self {
            loader,
            store,
            translator: SqlTranslator::new(settings.table.clone()).with_verification(settings.verify_sql),
        }
    }

    pub fn translator(&self) -> &SqlTranslator {
        &self.translator
    }

    /// Visits matching the criteria, selected by the store
    async fn matching_from_store(&self, dataset_id: &str, criteria: &SamplingCriteria) -> Result<Vec<SlimVisit>> {
        let config = ComputationConfig::builder("username")
            .filters(criteria.filters())
            .terminal_stage(TerminalStage::VisitLevel)
            .build()?;
        let compiled = self.translator.translate(&config, dataset_id)?;
        let rows = self.store.execute(&compiled).await?;
        let decoded = decode_rows(&config, &rows)?;
        Ok(decoded
            .visits()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(ordinal, row)| slim_from_row(row, ordinal))
            .collect())
    }
}

fn slim_from_row(row: &VisitRow, ordinal: usize) -> SlimVisit {
    SlimVisit {
        visit_id: row.visit_id.clone(),
        username: row.username.clone(),
        status: row.status.clone(),
        flagged: row.flagged,
        visit_date: row.visit_date,
        entity_id: row.entity_id.clone(),
        entity_name: row.entity_name.clone(),
        latitude: row.latitude,
        longitude: row.longitude,
        accuracy: row.accuracy,
        ordinal,
    }
}

#[async_trait]
impl AnalysisBackend for PushdownBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pushdown
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
        config.validate()?;
        let parsed = batch.parse_full()?;
        if parsed.excluded > 0 {
            warn!(
                dataset = dataset_id,
                excluded = parsed.excluded,
                "records failed to parse and were excluded"
            );
        }

        // The batch may be newer than what the store holds, so always replace
        let loaded = self.store.load(dataset_id, &parsed.records).await?;
        let compiled = self.translator.translate(config, dataset_id)?;

        let rows = self.store.execute(&compiled).await?;
        let decoded = decode_rows(config, &rows)?;

        let result = AnalysisResult::new(dataset_id, config, record_count, parsed.excluded as u64, decoded);
        self.loader.cache().put_result(&result)?;
        info!(
            dataset = dataset_id,
            store = self.store.name(),
            loaded,
            config_hash = %result.config_hash,
            rows = result.rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "pushdown computation complete"
        );
        Ok(result)
    }

    async fn filter_for_sampling(
        &self,
        dataset_id: &str,
        criteria: &SamplingCriteria,
    ) -> Result<SampleSelection> {
        criteria.validate()?;
        if self.store.loaded_count(dataset_id).await?.is_some() {
            let matching = self.matching_from_store(dataset_id, criteria).await?;
            return Ok(select(dataset_id, matching, criteria));
        }

        debug!(dataset = dataset_id, "dataset not in store, sampling from raw cache");
        let batch = self.loader.cached_for_sampling(dataset_id)?;
        let parsed = batch.parse_slim()?;
        Ok(filter_and_select(dataset_id, parsed.records, criteria))
    }

    async fn evict_cache(&self, dataset_id: &str, config_hash: Option<&str>) -> Result<EvictionCounts> {
        let counts = self.loader.cache().evict(dataset_id, config_hash)?;
        if config_hash.is_none() && self.store.drop_dataset(dataset_id).await? {
            debug!(dataset = dataset_id, "dataset dropped from relational store");
        }
        Ok(counts)
    }

    fn cache_report(&self, dataset_id: &str) -> Result<CacheReport> {
        Ok(self.loader.cache().report(dataset_id)?)
    }
}
