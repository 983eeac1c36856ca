//! Result rows
//!
//! Both backends produce these shapes. An [`AnalysisResult`] is what the cache
//! stores, so it carries no indication of which backend computed it.

use crate::model::{ComputationConfig, TerminalStage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use visitlens_core::{FieldValue, SlimVisit};

/// One row per visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRow {
    pub visit_id: String,
    pub username: Option<String>,
    pub status: String,
    pub visit_date: DateTime<Utc>,
    pub flagged: bool,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    /// Field name to transformed value, no aggregation
    pub computed: BTreeMap<String, Option<FieldValue>>,
}

impl VisitRow {
    /// Row with base attributes copied from the visit and nothing computed yet
    pub fn from_visit(visit: &SlimVisit) -> Self {
        Self {
            visit_id: visit.visit_id.clone(),
            username: visit.username.clone(),
            status: visit.status.clone(),
            visit_date: visit.visit_date,
            flagged: visit.flagged,
            entity_id: visit.entity_id.clone(),
            entity_name: visit.entity_name.clone(),
            latitude: visit.latitude,
            longitude: visit.longitude,
            accuracy: visit.accuracy,
            computed: BTreeMap::new(),
        }
    }
}

/// One row per grouping value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlwRow {
    pub grouping_value: String,
    pub total_visits: u64,
    pub approved_visits: u64,
    pub pending_visits: u64,
    pub rejected_visits: u64,
    pub flagged_visits: u64,
    pub first_visit_date: Option<DateTime<Utc>>,
    pub last_visit_date: Option<DateTime<Utc>>,
    pub custom_fields: BTreeMap<String, Option<FieldValue>>,
}

impl FlwRow {
    /// Row with the standard counts taken from a group's visits
    pub fn from_visits<'a>(
        grouping_value: impl Into<String>,
        visits: impl IntoIterator<Item = &'a SlimVisit>,
    ) -> Self {
        let mut row = Self {
            grouping_value: grouping_value.into(),
            total_visits: 0,
            approved_visits: 0,
            pending_visits: 0,
            rejected_visits: 0,
            flagged_visits: 0,
            first_visit_date: None,
            last_visit_date: None,
            custom_fields: BTreeMap::new(),
        };

        for visit in visits {
            row.total_visits += 1;
            match status_class(&visit.status) {
                Some(StatusClass::Approved) => row.approved_visits += 1,
                Some(StatusClass::Pending) => row.pending_visits += 1,
                Some(StatusClass::Rejected) => row.rejected_visits += 1,
                None => {}
            }
            if visit.flagged {
                row.flagged_visits += 1;
            }
            let date = visit.visit_date;
            row.first_visit_date = Some(row.first_visit_date.map_or(date, |d| d.min(date)));
            row.last_visit_date = Some(row.last_visit_date.map_or(date, |d| d.max(date)));
        }
        row
    }
}

/// Status buckets counted on every worker row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Approved,
    Pending,
    Rejected,
}

impl StatusClass {
    /// Lower-case status text matched by this bucket
    pub fn label(&self) -> &'static str {
        match self {
            StatusClass::Approved => "approved",
            StatusClass::Pending => "pending",
            StatusClass::Rejected => "rejected",
        }
    }
}

/// Classify a status, case-insensitively
pub fn status_class(status: &str) -> Option<StatusClass> {
    [StatusClass::Approved, StatusClass::Pending, StatusClass::Rejected]
        .into_iter()
        .find(|c| status.eq_ignore_ascii_case(c.label()))
}

/// Rows of either terminal stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "rows", rename_all = "snake_case")]
pub enum ResultRows {
    Visits(Vec<VisitRow>),
    Workers(Vec<FlwRow>),
}

impl ResultRows {
    pub fn len(&self) -> usize {
        match self {
            ResultRows::Visits(rows) => rows.len(),
            ResultRows::Workers(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stage(&self) -> TerminalStage {
        match self {
            ResultRows::Visits(_) => TerminalStage::VisitLevel,
            ResultRows::Workers(_) => TerminalStage::Aggregated,
        }
    }

    pub fn visits(&self) -> Option<&[VisitRow]> {
        match self {
            ResultRows::Visits(rows) => Some(rows),
            ResultRows::Workers(_) => None,
        }
    }

    pub fn workers(&self) -> Option<&[FlwRow]> {
        match self {
            ResultRows::Workers(rows) => Some(rows),
            ResultRows::Visits(_) => None,
        }
    }
}

/// A computed result as cached and returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub dataset_id: String,
    pub config_hash: String,
    pub terminal_stage: TerminalStage,
    /// Records in the dataset when this result was computed
    pub record_count: u64,
    /// Records that failed to parse and were left out
    pub excluded_records: u64,
    pub computed_at: DateTime<Utc>,
    pub rows: ResultRows,
}

impl AnalysisResult {
    /// Wrap rows computed now for `config`
    pub fn new(
        dataset_id: impl Into<String>,
        config: &ComputationConfig,
        record_count: u64,
        excluded_records: u64,
        rows: ResultRows,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            config_hash: config.config_hash(),
            terminal_stage: config.terminal_stage,
            record_count,
            excluded_records,
            computed_at: Utc::now(),
            rows,
        }
    }

    /// Find a worker row by grouping value
    pub fn worker(&self, grouping_value: &str) -> Option<&FlwRow> {
        self.rows
            .workers()
            .and_then(|rows| rows.iter().find(|r| r.grouping_value == grouping_value))
    }
}
