//! In-process executor
//!
//! Runs a [`ComputationConfig`] over parsed visit records: filter, order,
//! then either evaluate each visit or group and aggregate. Groups are
//! aggregated on rayon when there are enough of them and no cancellation
//! token is attached.

use crate::aggregation::aggregate_with_default;
use crate::error::{QueryError, Result};
use crate::histogram;
use crate::model::{ComputationConfig, TerminalStage};
use crate::result::{FlwRow, ResultRows, VisitRow};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use visitlens_core::VisitRecord;

/// Group count at which aggregation fans out across threads
pub const DEFAULT_GROUP_THRESHOLD: usize = 64;

/// In-process computation executor
#[derive(Debug, Clone)]
pub struct Executor {
    group_threshold: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Create an executor with the default parallel threshold
    pub fn new() -> Self {
        Self {
            group_threshold: DEFAULT_GROUP_THRESHOLD,
        }
    }

    /// Set the group count at which aggregation goes parallel
    pub fn with_group_threshold(mut self, threshold: usize) -> Self {
        self.group_threshold = threshold.max(1);
        self
    }

    /// Execute a config over records
    pub fn execute(&self, config: &ComputationConfig, records: &[VisitRecord]) -> Result<ResultRows> {
        self.run(config, records, None)
    }

    /// Execute with cancellation support
    pub fn execute_with_cancellation(
        &self,
        config: &ComputationConfig,
        records: &[VisitRecord],
        cancel: CancellationToken,
    ) -> Result<ResultRows> {
        self.run(config, records, Some(&cancel))
    }

    fn run(
        &self,
        config: &ComputationConfig,
        records: &[VisitRecord],
        cancel: Option<&CancellationToken>,
    ) -> Result<ResultRows> {
        let start = Instant::now();
        check_cancelled(cancel)?;
        config.validate()?;

        let mut selected: Vec<&VisitRecord> = records
            .iter()
            .filter(|r| config.filters.matches(&r.visit))
            .collect();
        selected.sort_by_key(|r| r.visit.order_key());

        let rows = match config.terminal_stage {
            TerminalStage::VisitLevel => ResultRows::Visits(visit_rows(config, &selected, cancel)?),
            TerminalStage::Aggregated => ResultRows::Workers(self.worker_rows(config, &selected, cancel)?),
        };

        debug!(
            input = records.len(),
            selected = selected.len(),
            rows = rows.len(),
            stage = %config.terminal_stage,
            elapsed_us = start.elapsed().as_micros() as u64,
            "in-process computation finished"
        );
        Ok(rows)
    }

    fn worker_rows(
        &self,
        config: &ComputationConfig,
        records: &[&VisitRecord],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<FlwRow>> {
        let mut groups: BTreeMap<String, Vec<&VisitRecord>> = BTreeMap::new();
        let mut ungrouped = 0usize;
        for record in records {
            match record.group_value(&config.grouping_key) {
                Some(key) => groups.entry(key).or_default().push(*record),
                None => ungrouped += 1,
            }
        }
        if ungrouped > 0 {
            debug!(ungrouped, key = %config.grouping_key, "visits without a grouping value skipped");
        }

        if groups.len() >= self.group_threshold && cancel.is_none() {
            // BTreeMap order is kept by the indexed parallel collect
            let groups: Vec<(String, Vec<&VisitRecord>)> = groups.into_iter().collect();
            Ok(groups
                .into_par_iter()
                .map(|(key, visits)| aggregate_group(config, key, &visits))
                .collect())
        } else {
            let mut rows = Vec::with_capacity(groups.len());
            for (key, visits) in groups {
                check_cancelled(cancel)?;
                rows.push(aggregate_group(config, key, &visits));
            }
            Ok(rows)
        }
    }
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(QueryError::Cancelled),
        _ => Ok(()),
    }
}

fn visit_rows(
    config: &ComputationConfig,
    records: &[&VisitRecord],
    cancel: Option<&CancellationToken>,
) -> Result<Vec<VisitRow>> {
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        check_cancelled(cancel)?;
        let mut row = VisitRow::from_visit(&record.visit);
        for field in &config.fields {
            let value = field
                .evaluate(&record.form_json)
                .or_else(|| field.default.clone());
            row.computed.insert(field.name.clone(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Aggregate one group's ordered visits into a worker row
fn aggregate_group(config: &ComputationConfig, key: String, visits: &[&VisitRecord]) -> FlwRow {
    let mut row = FlwRow::from_visits(key, visits.iter().map(|r| &r.visit));

    for field in &config.fields {
        let values: Vec<_> = visits.iter().map(|r| field.evaluate(&r.form_json)).collect();
        let value = aggregate_with_default(field.aggregation, &values, field.default.as_ref());
        row.custom_fields.insert(field.name.clone(), value);
    }

    for hist in &config.histograms {
        let values: Vec<_> = visits.iter().map(|r| hist.evaluate(&r.form_json)).collect();
        for (name, value) in histogram::bin(&values, hist).into_fields(hist) {
            row.custom_fields.insert(name, value);
        }
    }

    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationKind;
    use crate::model::{FieldComputation, HistogramComputation};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use visitlens_core::{FieldValue, SlimVisit, Transform};

    fn record(id: &str, user: &str, status: &str, hour: u32, form: Value) -> VisitRecord {
        let date = Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap();
        VisitRecord::new(SlimVisit::new(id, user, status, date), form)
    }

    fn records() -> Vec<VisitRecord> {
        vec![
            record("v1", "alice", "approved", 9, json!({"form": {"age": 10, "sick": "yes", "muac": 11.0}})),
            record("v2", "alice", "pending", 10, json!({"form": {"sick": "no"}})),
            record("v3", "alice", "approved", 11, json!({"form": {"age": 20, "muac": "12.1"}})),
            record("v4", "bob", "rejected", 8, json!({"form": {"age": "7", "sick": "YES"}})),
        ]
    }

    fn config(stage: TerminalStage) -> ComputationConfig {
        ComputationConfig::builder("username")
            .field(FieldComputation::new("avg_age", "form.age", AggregationKind::Avg))
            .field(
                FieldComputation::new("sick_count", "form.sick", AggregationKind::Count)
                    .transform(Transform::YesFlag),
            )
            .field(FieldComputation::new("first_age", "form.age", AggregationKind::First).default_value(-1i64))
            .histogram(HistogramComputation::new("muac", "form.muac", 9.5, 13.5, 4))
            .terminal_stage(stage)
            .build()
            .unwrap()
    }

    #[test]
    fn test_aggregated_rows() {
        let rows = Executor::new().execute(&config(TerminalStage::Aggregated), &records()).unwrap();
        let workers = rows.workers().unwrap();
        assert_eq!(workers.len(), 2);

        let alice = &workers[0];
        assert_eq!(alice.grouping_value, "alice");
        assert_eq!(alice.total_visits, 3);
        assert_eq!(alice.approved_visits, 2);
        assert_eq!(alice.custom_fields["avg_age"], Some(FieldValue::Float(15.0)));
        assert_eq!(alice.custom_fields["sick_count"], Some(FieldValue::Integer(1)));
        assert_eq!(alice.custom_fields["first_age"], Some(FieldValue::Integer(10)));
        assert_eq!(alice.custom_fields["muac_10_5_11_5"], Some(FieldValue::Integer(1)));
        assert_eq!(alice.custom_fields["muac_11_5_12_5"], Some(FieldValue::Integer(1)));
        assert_eq!(alice.custom_fields["muac_count"], Some(FieldValue::Integer(2)));
        assert_eq!(alice.custom_fields["muac_mean"], Some(FieldValue::Float(11.55)));

        let bob = &workers[1];
        assert_eq!(bob.custom_fields["avg_age"], Some(FieldValue::Float(7.0)));
        assert_eq!(bob.custom_fields["muac_mean"], None);
        assert_eq!(bob.custom_fields["muac_sparkline"], Some(FieldValue::String("▁▁▁▁".into())));
    }

    #[test]
    fn test_first_uses_visit_date_not_input_order() {
        let mut input = records();
        input.reverse();
        let rows = Executor::new().execute(&config(TerminalStage::Aggregated), &input).unwrap();
        let alice = &rows.workers().unwrap()[0];
        assert_eq!(alice.custom_fields["first_age"], Some(FieldValue::Integer(10)));
    }

    #[test]
    fn test_visit_level_rows() {
        let rows = Executor::new().execute(&config(TerminalStage::VisitLevel), &records()).unwrap();
        let visits = rows.visits().unwrap();
        assert_eq!(visits.len(), 4);
        // Ordered by visit date
        assert_eq!(visits[0].visit_id, "v4");
        assert_eq!(visits[1].computed["sick_count"], Some(FieldValue::Integer(1)));
        assert_eq!(visits[2].computed["sick_count"], None);
        assert_eq!(visits[2].computed["first_age"], Some(FieldValue::Integer(-1)));
    }

    #[test]
    fn test_filters_apply_before_grouping() {
        let config = ComputationConfig::builder("username")
            .field(FieldComputation::new("n", "form.age", AggregationKind::Count))
            .status("approved")
            .build()
            .unwrap();
        let rows = Executor::new().execute(&config, &records()).unwrap();
        let workers = rows.workers().unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].total_visits, 2);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut input = Vec::new();
        for i in 0..200 {
            let user = format!("user{:03}", i % 50);
            input.push(record(&format!("v{}", i), &user, "approved", (i % 24) as u32, json!({"form": {"age": i}})));
        }
        let config = config(TerminalStage::Aggregated);
        let parallel = Executor::new().with_group_threshold(1).execute(&config, &input).unwrap();
        let sequential = Executor::new().with_group_threshold(usize::MAX).execute(&config, &input).unwrap();
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = Executor::new().execute_with_cancellation(&config(TerminalStage::Aggregated), &records(), cancel);
        assert!(matches!(result, Err(QueryError::Cancelled)));
    }

    #[test]
    fn test_missing_group_value_skipped() {
        let mut input = records();
        input[0].visit.username = None;
        let rows = Executor::new().execute(&config(TerminalStage::Aggregated), &input).unwrap();
        assert_eq!(rows.workers().unwrap()[0].total_visits, 2);
    }
}
