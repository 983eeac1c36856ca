//! Cache entries and the freshness rule
//!
//! Every stored value is a bincode envelope carrying the record count and
//! computation time in front of the payload, so reports and validation read
//! the header without decoding the payload. Result payloads are JSON (the
//! value model is self-describing); raw batches are bincode.

use crate::error::{CacheError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const ENVELOPE_VERSION: u8 = 1;

/// A cached payload with the freshness data it was stored under
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    /// Record count of the dataset when the payload was computed
    pub record_count: u64,
    pub computed_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> CacheEntry<T> {
    /// Entry stamped with the current time
    pub fn new(record_count: u64, payload: T) -> Self {
        Self {
            record_count,
            computed_at: Utc::now(),
            payload,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.computed_at
    }

    pub fn is_valid(&self, current_count: u64, tolerance: Option<Duration>, now: DateTime<Utc>) -> bool {
        validate(current_count, self, tolerance, now)
    }

    pub(crate) fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheEntry<U> {
        CacheEntry {
            record_count: self.record_count,
            computed_at: self.computed_at,
            payload: f(self.payload),
        }
    }
}

/// An entry is valid when its record count matches, or when a tolerance is
/// given and the entry is younger than it
pub fn validate<T>(
    current_count: u64,
    entry: &CacheEntry<T>,
    tolerance: Option<Duration>,
    now: DateTime<Utc>,
) -> bool {
    if entry.record_count == current_count {
        return true;
    }
    tolerance.is_some_and(|window| entry.age(now) < window)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum PayloadFormat {
    Json,
    Bincode,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
    version: u8,
    record_count: u64,
    computed_at_ms: i64,
    format: PayloadFormat,
    payload: Vec<u8>,
}

impl Envelope {
    pub(crate) fn encode<T: Serialize>(entry: &CacheEntry<T>, format: PayloadFormat) -> Result<Vec<u8>> {
        let payload = match format {
            PayloadFormat::Json => serde_json::to_vec(&entry.payload)?,
            PayloadFormat::Bincode => bincode::serialize(&entry.payload)?,
        };
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            record_count: entry.record_count,
            computed_at_ms: entry.computed_at.timestamp_millis(),
            format,
            payload,
        };
        Ok(bincode::serialize(&envelope)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Envelope> {
        let envelope: Envelope = bincode::deserialize(bytes)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CacheError::Serialization(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    /// Header with the payload left encoded
    pub(crate) fn header(&self) -> Result<CacheEntry<()>> {
        let computed_at = DateTime::from_timestamp_millis(self.computed_at_ms).ok_or_else(|| {
            CacheError::Serialization(format!("timestamp out of range: {}", self.computed_at_ms))
        })?;
        Ok(CacheEntry {
            record_count: self.record_count,
            computed_at,
            payload: (),
        })
    }

    pub(crate) fn into_entry<T: DeserializeOwned>(self, expected: PayloadFormat) -> Result<CacheEntry<T>> {
        if self.format != expected {
            return Err(CacheError::Serialization(format!(
                "expected {:?} payload, found {:?}",
                expected, self.format
            )));
        }
        let payload: T = match self.format {
            PayloadFormat::Json => serde_json::from_slice(&self.payload)?,
            PayloadFormat::Bincode => bincode::deserialize(&self.payload)?,
        };
        Ok(self.header()?.map(|()| payload))
    }
}
