//! Cache manager
//!
//! Owns every entry in the store under its key prefix. Lookups that hit a
//! value which no longer decodes evict it and report a miss.
//!
//! Concurrent computations of the same `(dataset, config hash)` are not
//! coordinated: two callers that miss together both compute and both store,
//! and the last write wins. Results for identical inputs are identical, so
//! the duplicate work is the only cost.

use crate::entry::{CacheEntry, Envelope, PayloadFormat};
use crate::error::Result;
use crate::keys::{check_component, CacheKey, CacheTier, DEFAULT_KEY_PREFIX};
use crate::store::CacheStore;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use visitlens_core::RawVisitBatch;
use visitlens_query::AnalysisResult;

/// Cache manager configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub key_prefix: String,
    /// Store-level expiry; `None` keeps entries until evicted
    pub ttl: Option<std::time::Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: Some(std::time::Duration::from_secs(24 * 60 * 60)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawPayload {
    slim: bool,
    bytes: Vec<u8>,
}

/// Entries removed per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionCounts {
    pub raw_visits: usize,
    pub visit_results: usize,
    pub worker_results: usize,
}

impl EvictionCounts {
    pub fn total(&self) -> usize {
        self.raw_visits + self.visit_results + self.worker_results
    }

    fn record(&mut self, tier: CacheTier) {
        match tier {
            CacheTier::RawVisits => self.raw_visits += 1,
            CacheTier::VisitResults => self.visit_results += 1,
            CacheTier::WorkerResults => self.worker_results += 1,
        }
    }
}

/// One entry in a cache report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheReportEntry {
    pub tier: CacheTier,
    /// Config hash, or fetch mode for raw batches
    pub discriminator: String,
    pub record_count: u64,
    pub computed_at: DateTime<Utc>,
    pub age_secs: i64,
    pub size_bytes: usize,
}

/// Cached entries of one dataset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheReport {
    pub dataset_id: String,
    pub entries: Vec<CacheReportEntry>,
}

impl CacheReport {
    pub fn tier(&self, tier: CacheTier) -> impl Iterator<Item = &CacheReportEntry> {
        self.entries.iter().filter(move |e| e.tier == tier)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Three-tier cache over an opaque key-value store
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    pub fn with_defaults(store: Arc<dyn CacheStore>) -> Self {
        Self::new(store, CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn storage_key(&self, key: &CacheKey) -> Result<String> {
        check_component(&key.dataset_id)?;
        check_component(&key.discriminator)?;
        Ok(key.to_storage_key(&self.config.key_prefix))
    }

    /// Decode a stored entry; undecodable values are evicted and read as misses
    fn load<T: DeserializeOwned>(
        &self,
        key: &str,
        format: PayloadFormat,
    ) -> Result<Option<CacheEntry<T>>> {
        let Some(bytes) = self.store.get(key)? else {
            return Ok(None);
        };
        match Envelope::decode(&bytes).and_then(|env| env.into_entry(format)) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key, error = %e, "corrupt cache entry evicted");
                self.store.delete(key)?;
                Ok(None)
            }
        }
    }

    fn save<T: Serialize>(&self, key: &str, entry: &CacheEntry<T>, format: PayloadFormat) -> Result<()> {
        let bytes = Envelope::encode(entry, format)?;
        let size = bytes.len();
        self.store.set(key, bytes, self.config.ttl)?;
        debug!(key, size, record_count = entry.record_count, "cache entry stored");
        Ok(())
    }

    /// Cached raw batch. A slim request is served by a full batch when no
    /// slim batch is cached.
    pub fn get_raw(&self, dataset_id: &str, slim: bool) -> Result<Option<CacheEntry<RawVisitBatch>>> {
        let modes: &[bool] = if slim { &[true, false] } else { &[false] };
        for &mode in modes {
            let key = self.storage_key(&CacheKey::raw(dataset_id, mode))?;
            if let Some(entry) = self.load::<RawPayload>(&key, PayloadFormat::Bincode)? {
                return Ok(Some(entry.map(|raw| RawVisitBatch::new(raw.bytes, raw.slim))));
            }
        }
        Ok(None)
    }

    /// Store a raw batch under its fetch mode
    pub fn put_raw(&self, dataset_id: &str, batch: &RawVisitBatch, record_count: u64) -> Result<()> {
        let key = self.storage_key(&CacheKey::raw(dataset_id, batch.is_slim()))?;
        let entry = CacheEntry::new(
            record_count,
            RawPayload {
                slim: batch.is_slim(),
                bytes: batch.bytes().to_vec(),
            },
        );
        self.save(&key, &entry, PayloadFormat::Bincode)
    }

    /// True when a raw batch usable for the mode is cached for `expected_count`
    pub fn has_valid_raw(
        &self,
        dataset_id: &str,
        expected_count: u64,
        slim: bool,
        tolerance: Option<Duration>,
    ) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .get_raw(dataset_id, slim)?
            .is_some_and(|entry| entry.is_valid(expected_count, tolerance, now)))
    }

    /// Stored result regardless of freshness
    pub fn get_result(
        &self,
        dataset_id: &str,
        config_hash: &str,
        tier: CacheTier,
    ) -> Result<Option<CacheEntry<AnalysisResult>>> {
        let key = self.storage_key(&CacheKey::result(dataset_id, tier, config_hash))?;
        self.load(&key, PayloadFormat::Json)
    }

    /// Stored result if it is valid for `current_count`
    pub fn get_valid_result(
        &self,
        dataset_id: &str,
        config_hash: &str,
        tier: CacheTier,
        current_count: u64,
        tolerance: Option<Duration>,
    ) -> Result<Option<AnalysisResult>> {
        self.get_valid_result_at(dataset_id, config_hash, tier, current_count, tolerance, Utc::now())
    }

    /// [`Self::get_valid_result`] against an explicit clock
    pub fn get_valid_result_at(
        &self,
        dataset_id: &str,
        config_hash: &str,
        tier: CacheTier,
        current_count: u64,
        tolerance: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Option<AnalysisResult>> {
        match self.get_result(dataset_id, config_hash, tier)? {
            Some(entry) if entry.is_valid(current_count, tolerance, now) => {
                debug!(dataset = dataset_id, config_hash, %tier, "result cache hit");
                Ok(Some(entry.payload))
            }
            Some(entry) => {
                info!(
                    dataset = dataset_id,
                    config_hash,
                    %tier,
                    cached_count = entry.record_count,
                    current_count,
                    "stale cached result"
                );
                Ok(None)
            }
            None => {
                debug!(dataset = dataset_id, config_hash, %tier, "result cache miss");
                Ok(None)
            }
        }
    }

    /// Store a result in the tier of its terminal stage
    pub fn put_result(&self, result: &AnalysisResult) -> Result<()> {
        let entry = CacheEntry {
            record_count: result.record_count,
            computed_at: result.computed_at,
            payload: result,
        };
        let tier = CacheTier::for_stage(result.terminal_stage);
        let key = self.storage_key(&CacheKey::result(&result.dataset_id, tier, &result.config_hash))?;
        self.save(&key, &entry, PayloadFormat::Json)
    }

    /// Evict every tier of a dataset, or only the result tiers of one config
    pub fn evict(&self, dataset_id: &str, config_hash: Option<&str>) -> Result<EvictionCounts> {
        check_component(dataset_id)?;
        let mut counts = EvictionCounts::default();

        match config_hash {
            Some(hash) => {
                for tier in [CacheTier::VisitResults, CacheTier::WorkerResults] {
                    let key = self.storage_key(&CacheKey::result(dataset_id, tier, hash))?;
                    if self.store.delete(&key)? {
                        counts.record(tier);
                    }
                }
            }
            None => {
                let pattern = CacheKey::dataset_pattern(&self.config.key_prefix, dataset_id);
                for key in self.store.keys_with_prefix(&pattern)? {
                    let parsed = CacheKey::parse(&self.config.key_prefix, dataset_id, &key);
                    if self.store.delete(&key)? {
                        if let Some(parsed) = parsed {
                            counts.record(parsed.tier);
                        }
                    }
                }
            }
        }

        info!(
            dataset = dataset_id,
            config_hash = config_hash.unwrap_or("*"),
            removed = counts.total(),
            "cache evicted"
        );
        Ok(counts)
    }

    /// Entries cached for a dataset, ordered by tier then discriminator
    pub fn report(&self, dataset_id: &str) -> Result<CacheReport> {
        check_component(dataset_id)?;
        let now = Utc::now();
        let pattern = CacheKey::dataset_pattern(&self.config.key_prefix, dataset_id);
        let mut entries = Vec::new();

        for key in self.store.keys_with_prefix(&pattern)? {
            let Some(parsed) = CacheKey::parse(&self.config.key_prefix, dataset_id, &key) else {
                continue;
            };
            let Some(bytes) = self.store.get(&key)? else {
                continue;
            };
            let header = match Envelope::decode(&bytes).and_then(|env| env.header()) {
                Ok(header) => header,
                Err(e) => {
                    warn!(key = %key, error = %e, "corrupt cache entry evicted");
                    self.store.delete(&key)?;
                    continue;
                }
            };
            entries.push(CacheReportEntry {
                tier: parsed.tier,
                discriminator: parsed.discriminator,
                record_count: header.record_count,
                computed_at: header.computed_at,
                age_secs: header.age(now).num_seconds(),
                size_bytes: bytes.len(),
            });
        }

        entries.sort_by(|a, b| (a.tier, &a.discriminator).cmp(&(b.tier, &b.discriminator)));
        Ok(CacheReport {
            dataset_id: dataset_id.to_string(),
            entries,
        })
    }
}
