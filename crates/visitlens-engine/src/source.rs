//! Raw record sources
//!
//! The record source is an external collaborator. The engine only needs a
//! record count and a batch fetch, both scoped by a caller-supplied
//! credential. Fetches run under a timeout and the engine's cancellation
//! token; a timeout surfaces as a retryable error and is never retried here.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use visitlens_core::{RawVisitBatch, VisitRecord};

/// Caller-supplied access credential
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(***)")
    }
}

/// One batch fetch
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub dataset_id: String,
    pub credentials: Credentials,
    /// Omit the payload column
    pub slim: bool,
    /// Fetch only these visit ids
    pub id_filter: Option<Vec<String>>,
}

/// External source of raw visit records
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch a batch of raw records
    async fn fetch(&self, request: &FetchRequest) -> Result<RawVisitBatch>;

    /// Current number of records in a dataset
    async fn record_count(&self, dataset_id: &str, credentials: &Credentials) -> Result<u64>;

    /// Source name for logging
    fn name(&self) -> &'static str {
        "record-source"
    }
}

/// Run a source call under a timeout and a cancellation token.
///
/// Cancellation is checked first, so a cancelled token fails even a call that
/// would complete immediately.
pub async fn with_deadline<T, F>(
    dataset_id: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    call: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::FetchCancelled(dataset_id.to_string())),
        outcome = tokio::time::timeout(timeout, call) => match outcome {
            Ok(result) => result,
            Err(_) => Err(EngineError::FetchTimeout {
                dataset_id: dataset_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        },
    }
}

/// Fetch a batch with timeout and cancellation, logging its timing
pub async fn fetch_with_timeout(
    source: &dyn RecordSource,
    request: &FetchRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<RawVisitBatch> {
    let start = Instant::now();
    let batch = with_deadline(&request.dataset_id, timeout, cancel, source.fetch(request)).await?;
    info!(
        source = source.name(),
        dataset = %request.dataset_id,
        slim = request.slim,
        filtered = request.id_filter.is_some(),
        bytes = batch.bytes().len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "raw visits fetched"
    );
    Ok(batch)
}

/// In-memory record source
///
/// Holds each dataset as a JSON array of visit objects and serves slim and
/// id-filtered fetches from it. Used for local runs and tests.
#[derive(Default)]
pub struct StaticRecordSource {
    datasets: RwLock<HashMap<String, Vec<Value>>>,
    required_token: Option<String>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl StaticRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject requests whose credential does not carry `token`
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.required_token = Some(token.into());
        self
    }

    /// Delay every fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace a dataset with serialized records
    pub fn insert(&self, dataset_id: &str, records: &[VisitRecord]) -> Result<()> {
        let items = records
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::SourceRejected(e.to_string()))?;
        self.datasets.write().insert(dataset_id.to_string(), items);
        Ok(())
    }

    /// Replace a dataset with raw JSON array text
    pub fn insert_raw(&self, dataset_id: &str, json: &str) -> Result<()> {
        let items: Vec<Value> =
            serde_json::from_str(json).map_err(|e| EngineError::SourceRejected(e.to_string()))?;
        self.datasets.write().insert(dataset_id.to_string(), items);
        Ok(())
    }

    /// Number of fetches served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    fn authorize(&self, credentials: &Credentials) -> Result<()> {
        match &self.required_token {
            Some(token) if token != credentials.token() => {
                Err(EngineError::SourceRejected("invalid credentials".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn dataset(&self, dataset_id: &str) -> Result<Vec<Value>> {
        self.datasets
            .read()
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| EngineError::SourceRejected(format!("unknown dataset '{}'", dataset_id)))
    }
}

fn item_id(item: &Value) -> Option<String> {
    match item.get("id").or_else(|| item.get("visit_id"))? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl RecordSource for StaticRecordSource {
    async fn fetch(&self, request: &FetchRequest) -> Result<RawVisitBatch> {
        self.authorize(&request.credentials)?;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let wanted: Option<HashSet<&str>> = request
            .id_filter
            .as_ref()
            .map(|ids| ids.iter().map(String::as_str).collect());

        let items: Vec<Value> = self
            .dataset(&request.dataset_id)?
            .into_iter()
            .filter(|item| match &wanted {
                Some(ids) => item_id(item).is_some_and(|id| ids.contains(id.as_str())),
                None => true,
            })
            .map(|mut item| {
                if request.slim {
                    if let Value::Object(map) = &mut item {
                        map.remove("form_json");
                    }
                }
                item
            })
            .collect();

        debug!(dataset = %request.dataset_id, records = items.len(), "static source served batch");
        let bytes = serde_json::to_vec(&items).map_err(|e| EngineError::SourceUnavailable(e.to_string()))?;
        Ok(RawVisitBatch::new(bytes, request.slim))
    }

    async fn record_count(&self, dataset_id: &str, credentials: &Credentials) -> Result<u64> {
        self.authorize(credentials)?;
        Ok(self.dataset(dataset_id)?.len() as u64)
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
