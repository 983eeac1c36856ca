//! Relational store abstraction
//!
//! The pushdown backend hands a [`CompiledQuery`] to a [`RelationalStore`] and
//! gets rows keyed by output column name. A production store sends
//! `CompiledQuery::sql` to PostgreSQL; [`MemoryRelationalStore`] evaluates the
//! plan itself and is the reference implementation the tests compare against.

use crate::error::{Result, SqlError};
use crate::eval;
use crate::translator::CompiledQuery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use visitlens_core::{FieldValue, VisitRecord};

/// A value in a store row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
    Array(Vec<SqlValue>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Field value view; `Null` and JSON null are absent
    pub fn to_field_value(&self) -> Option<FieldValue> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(FieldValue::Boolean(*b)),
            SqlValue::Int(i) => Some(FieldValue::Integer(*i)),
            SqlValue::Number(f) => Some(FieldValue::Float(*f)),
            SqlValue::Text(s) => Some(FieldValue::String(s.clone())),
            SqlValue::Json(v) => FieldValue::from_json(v),
            SqlValue::Timestamp(t) => Some(FieldValue::String(t.to_rfc3339())),
            SqlValue::Array(items) => Some(FieldValue::List(
                items.iter().filter_map(SqlValue::to_field_value).collect(),
            )),
        }
    }

    /// Numeric view, accepting integers and numeric text
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(i) => Some(*i as f64),
            SqlValue::Number(f) => Some(*f),
            SqlValue::Text(s) => visitlens_core::parse_numeric_text(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::Number(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(SqlValue::Null, SqlValue::Text)
    }
}

impl From<Option<f64>> for SqlValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(SqlValue::Null, SqlValue::Number)
    }
}

/// One result row, keyed by output column name
pub type StoreRow = BTreeMap<String, SqlValue>;

/// External relational store used by the pushdown backend
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Replace the rows of a dataset. Returns the number of rows stored.
    async fn load(&self, dataset_id: &str, records: &[VisitRecord]) -> Result<usize>;

    /// Number of rows held for a dataset, `None` if it was never loaded
    async fn loaded_count(&self, dataset_id: &str) -> Result<Option<usize>>;

    /// Run one compiled query
    async fn execute(&self, query: &CompiledQuery) -> Result<Vec<StoreRow>>;

    /// Remove a dataset's rows. Returns true if anything was removed.
    async fn drop_dataset(&self, dataset_id: &str) -> Result<bool>;

    /// Store name for logging
    fn name(&self) -> &'static str;
}

/// In-memory store that evaluates query plans directly
#[derive(Default)]
pub struct MemoryRelationalStore {
    datasets: RwLock<HashMap<String, Arc<Vec<VisitRecord>>>>,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loaded datasets
    pub fn dataset_count(&self) -> usize {
        self.datasets.read().len()
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn load(&self, dataset_id: &str, records: &[VisitRecord]) -> Result<usize> {
        let count = records.len();
        self.datasets
            .write()
            .insert(dataset_id.to_string(), Arc::new(records.to_vec()));
        info!(dataset = dataset_id, rows = count, "dataset loaded into memory store");
        Ok(count)
    }

    async fn loaded_count(&self, dataset_id: &str) -> Result<Option<usize>> {
        Ok(self.datasets.read().get(dataset_id).map(|rows| rows.len()))
    }

    async fn execute(&self, query: &CompiledQuery) -> Result<Vec<StoreRow>> {
        let rows = self
            .datasets
            .read()
            .get(&query.plan.dataset_id)
            .cloned()
            .ok_or_else(|| {
                SqlError::Store(format!("dataset '{}' is not loaded", query.plan.dataset_id))
            })?;

        let result = eval::evaluate(&query.plan, &rows);
        debug!(
            dataset = %query.plan.dataset_id,
            input = rows.len(),
            output = result.len(),
            "memory store evaluated plan"
        );
        Ok(result)
    }

    async fn drop_dataset(&self, dataset_id: &str) -> Result<bool> {
        Ok(self.datasets.write().remove(dataset_id).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::SqlTranslator;
    use chrono::TimeZone;
    use serde_json::json;
    use visitlens_core::SlimVisit;
    use visitlens_query::{AggregationKind, ComputationConfig, FieldComputation};

    fn records() -> Vec<VisitRecord> {
        let date = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        vec![
            VisitRecord::new(SlimVisit::new("1", "a", "approved", date), json!({"x": 1})),
            VisitRecord::new(SlimVisit::new("2", "b", "approved", date), json!({"x": 2})),
        ]
    }

    #[test]
    fn test_sql_value_field_view() {
        assert_eq!(SqlValue::Null.to_field_value(), None);
        assert_eq!(SqlValue::Json(json!(null)).to_field_value(), None);
        assert_eq!(SqlValue::Json(json!("x")).to_field_value(), Some(FieldValue::String("x".into())));
        assert_eq!(SqlValue::Text("2.5".into()).as_f64(), Some(2.5));
        assert_eq!(SqlValue::Number(3.0).as_i64(), Some(3));
    }

    #[tokio::test]
    async fn test_load_execute_drop() {
        let store = MemoryRelationalStore::new();
        assert_eq!(store.loaded_count("d1").await.unwrap(), None);
        assert_eq!(store.load("d1", &records()).await.unwrap(), 2);
        assert_eq!(store.loaded_count("d1").await.unwrap(), Some(2));

        let config = ComputationConfig::builder("username")
            .field(FieldComputation::new("total", "x", AggregationKind::Sum))
            .build()
            .unwrap();
        let compiled = SqlTranslator::new("visits").translate(&config, "d1").unwrap();
        let rows = store.execute(&compiled).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["grouping_value"], SqlValue::Text("a".into()));
        assert_eq!(rows[1]["total"], SqlValue::Number(2.0));

        assert!(store.drop_dataset("d1").await.unwrap());
        assert!(!store.drop_dataset("d1").await.unwrap());
        assert!(matches!(store.execute(&compiled).await, Err(SqlError::Store(_))));
    }
}
