//! Raw visit records
//!
//! The record source hands back a JSON array of visit objects. The bytes are
//! kept as an immutable [`RawVisitBatch`] (that is what the raw cache tier
//! stores) and parsed lazily: [`RawVisitBatch::parse_slim`] skips the heavy
//! `form_json` payload, [`RawVisitBatch::parse_full`] keeps it. A record that
//! fails to deserialize is excluded and counted rather than zero-filled.

use crate::error::{CoreError, Result};
use crate::extract::extract_value;
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Record attributes addressable by name without touching the payload
pub const BASE_ATTRIBUTES: &[&str] = &["visit_id", "username", "status", "entity_id", "entity_name"];

/// Returns true if `key` names a base attribute rather than a payload path
pub fn is_base_attribute(key: &str) -> bool {
    BASE_ATTRIBUTES.contains(&key)
}

/// Visit attributes without the payload blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlimVisit {
    #[serde(alias = "id", deserialize_with = "string_or_number")]
    pub visit_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub flagged: bool,
    pub visit_date: DateTime<Utc>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub entity_name: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Position within the batch; tie-break after `visit_date`
    #[serde(skip)]
    pub ordinal: usize,
}

impl SlimVisit {
    /// Create a visit with only the required attributes set
    pub fn new(
        visit_id: impl Into<String>,
        username: impl Into<String>,
        status: impl Into<String>,
        visit_date: DateTime<Utc>,
    ) -> Self {
        Self {
            visit_id: visit_id.into(),
            username: Some(username.into()),
            status: status.into(),
            flagged: false,
            visit_date,
            entity_id: None,
            entity_name: None,
            latitude: None,
            longitude: None,
            accuracy: None,
            ordinal: 0,
        }
    }

    /// Look up a base attribute by name
    pub fn attribute(&self, key: &str) -> Option<String> {
        match key {
            "visit_id" | "id" => Some(self.visit_id.clone()),
            "username" => self.username.clone(),
            "status" => Some(self.status.clone()),
            "entity_id" => self.entity_id.clone(),
            "entity_name" => self.entity_name.clone(),
            _ => None,
        }
    }

    /// Ordering key shared by every order-sensitive reducer
    pub fn order_key(&self) -> (DateTime<Utc>, usize) {
        (self.visit_date, self.ordinal)
    }
}

/// A fully parsed visit including its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    #[serde(flatten)]
    pub visit: SlimVisit,
    #[serde(default)]
    pub form_json: Value,
}

impl VisitRecord {
    /// Create a record from slim attributes and a payload
    pub fn new(visit: SlimVisit, form_json: Value) -> Self {
        Self { visit, form_json }
    }

    /// Grouping value: a base attribute, or the text of a payload path.
    ///
    /// Payload numbers group by [`crate::FieldValue::to_text`], so `1.50` and `1.5`
    /// share a group on both backends.
    pub fn group_value(&self, key: &str) -> Option<String> {
        if is_base_attribute(key) {
            return self.visit.attribute(key);
        }
        extract_value(&self.form_json, &[key]).map(|v| v.to_text())
    }
}

/// Parsed records plus the number that failed to parse
#[derive(Debug, Clone)]
pub struct ParsedVisits<T> {
    pub records: Vec<T>,
    pub excluded: usize,
}

trait Ordinal {
    fn set_ordinal(&mut self, ordinal: usize);
}

impl Ordinal for SlimVisit {
    fn set_ordinal(&mut self, ordinal: usize) {
        self.ordinal = ordinal;
    }
}

impl Ordinal for VisitRecord {
    fn set_ordinal(&mut self, ordinal: usize) {
        self.visit.ordinal = ordinal;
    }
}

#[derive(Deserialize)]
struct IdOnly {
    #[serde(alias = "id", deserialize_with = "string_or_number")]
    visit_id: String,
}

/// Immutable raw record bytes as returned by the record source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawVisitBatch {
    bytes: Arc<[u8]>,
    slim: bool,
}

impl RawVisitBatch {
    /// Wrap fetched bytes
    pub fn new(bytes: impl Into<Arc<[u8]>>, slim: bool) -> Self {
        Self {
            bytes: bytes.into(),
            slim,
        }
    }

    /// Encode full records
    pub fn from_records(records: &[VisitRecord]) -> Result<Self> {
        Ok(Self::new(serde_json::to_vec(records)?, false))
    }

    /// Encode slim records
    pub fn from_slim_records(records: &[SlimVisit]) -> Result<Self> {
        Ok(Self::new(serde_json::to_vec(records)?, true))
    }

    /// Raw bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the payload column was omitted at fetch time
    pub fn is_slim(&self) -> bool {
        self.slim
    }

    /// Number of records in the batch, without deserializing them
    pub fn record_count(&self) -> Result<usize> {
        let items: Vec<IgnoredAny> = serde_json::from_slice(&self.bytes)
            .map_err(|e| CoreError::MalformedBatch(e.to_string()))?;
        Ok(items.len())
    }

    /// Parse without the payload blob
    pub fn parse_slim(&self) -> Result<ParsedVisits<SlimVisit>> {
        parse_records(&self.bytes)
    }

    /// Parse including the payload blob
    pub fn parse_full(&self) -> Result<ParsedVisits<VisitRecord>> {
        if self.slim {
            return Err(CoreError::SlimBatch);
        }
        parse_records(&self.bytes)
    }

    /// Keep only records whose id is in `ids`, preserving their raw bytes and order
    pub fn retain_ids(&self, ids: &HashSet<String>) -> Result<Self> {
        let items = raw_items(&self.bytes)?;
        let mut out = Vec::with_capacity(self.bytes.len());
        out.push(b'[');
        let mut first = true;
        for item in items {
            let keep = serde_json::from_str::<IdOnly>(item.get())
                .map(|id| ids.contains(&id.visit_id))
                .unwrap_or(false);
            if keep {
                if !first {
                    out.push(b',');
                }
                out.extend_from_slice(item.get().as_bytes());
                first = false;
            }
        }
        out.push(b']');
        Ok(Self::new(out, self.slim))
    }
}

fn raw_items(bytes: &[u8]) -> Result<Vec<&RawValue>> {
    serde_json::from_slice(bytes).map_err(|e| CoreError::MalformedBatch(e.to_string()))
}

fn parse_records<T: DeserializeOwned + Ordinal>(bytes: &[u8]) -> Result<ParsedVisits<T>> {
    let items = raw_items(bytes)?;
    let mut records = Vec::with_capacity(items.len());
    let mut excluded = 0;

    for (ordinal, item) in items.iter().enumerate() {
        match serde_json::from_str::<T>(item.get()) {
            Ok(mut record) => {
                record.set_ordinal(ordinal);
                records.push(record);
            }
            Err(e) => {
                excluded += 1;
                tracing::debug!(ordinal, error = %e, "excluding unparseable visit record");
            }
        }
    }

    if excluded > 0 {
        warn!(excluded, parsed = records.len(), "visit records excluded during parse");
    }

    Ok(ParsedVisits { records, excluded })
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Int(i64),
        Uint(u64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Int(i) => i.to_string(),
        Id::Uint(u) => u.to_string(),
    })
}
