//! Computation config model
//!
//! A [`ComputationConfig`] is the declarative unit both backends execute: the
//! field computations, histogram computations, record filters, grouping key
//! and terminal stage. Configs are validated when built or parsed, so an
//! unknown aggregation or stage never reaches a backend. Two configs are the
//! same for caching purposes when their fingerprints ([`ComputationConfig::config_hash`])
//! match.

use crate::aggregation::AggregationKind;
use crate::error::ConfigError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use visitlens_core::{extract_value, FieldValue, SlimVisit, Transform, TransformRegistry};

type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Whether the engine stops at per-visit rows or aggregates per group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStage {
    /// One row per visit
    VisitLevel,
    /// One row per grouping value
    Aggregated,
}

impl TerminalStage {
    pub fn name(&self) -> &'static str {
        match self {
            TerminalStage::VisitLevel => "visit_level",
            TerminalStage::Aggregated => "aggregated",
        }
    }
}

impl fmt::Display for TerminalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TerminalStage {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "visitlevel" | "visit" | "visits" => Ok(TerminalStage::VisitLevel),
            "aggregated" | "aggregate" | "flw" => Ok(TerminalStage::Aggregated),
            _ => Err(ConfigError::UnknownTerminalStage(s.to_string())),
        }
    }
}

/// One extracted, transformed and aggregated output field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldComputation {
    pub name: String,
    /// Fallback chain; the first present, non-null path wins
    pub paths: Vec<String>,
    pub aggregation: AggregationKind,
    pub transform: Option<Transform>,
    pub default: Option<FieldValue>,
    pub description: String,
}

impl FieldComputation {
    /// Create a computation over a single path
    pub fn new(name: impl Into<String>, path: impl Into<String>, aggregation: AggregationKind) -> Self {
        Self {
            name: name.into(),
            paths: vec![path.into()],
            aggregation,
            transform: None,
            default: None,
            description: String::new(),
        }
    }

    /// Append a fallback path
    pub fn or_path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Set the transform
    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Set the default used when no values survive
    pub fn default_value(mut self, value: impl Into<FieldValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Per-visit value: extraction followed by the optional transform
    pub fn evaluate(&self, form_json: &serde_json::Value) -> Option<FieldValue> {
        let raw = extract_value(form_json, &self.paths);
        match self.transform {
            Some(t) => t.apply_opt(raw.as_ref()),
            None => raw,
        }
    }

    /// Validate name and paths
    pub fn validate(&self) -> ConfigResult<()> {
        validate_name_and_paths(&self.name, &self.paths)
    }
}

/// Fixed-width histogram over a numeric field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramComputation {
    pub name: String,
    pub paths: Vec<String>,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub num_bins: u32,
    pub bin_name_prefix: String,
    /// Clamp out-of-range values into the edge bins instead of discarding them
    pub include_out_of_range: bool,
    pub transform: Option<Transform>,
    pub description: String,
}

impl HistogramComputation {
    /// Create a histogram over a single path
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        lower_bound: f64,
        upper_bound: f64,
        num_bins: u32,
    ) -> Self {
        let name = name.into();
        Self {
            bin_name_prefix: name.clone(),
            name,
            paths: vec![path.into()],
            lower_bound,
            upper_bound,
            num_bins,
            include_out_of_range: false,
            transform: None,
            description: String::new(),
        }
    }

    /// Append a fallback path
    pub fn or_path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Set the bin column prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.bin_name_prefix = prefix.into();
        self
    }

    /// Clamp out-of-range values into the edge bins
    pub fn include_out_of_range(mut self, include: bool) -> Self {
        self.include_out_of_range = include;
        self
    }

    /// Set the transform
    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn bin_width(&self) -> f64 {
        (self.upper_bound - self.lower_bound) / self.num_bins as f64
    }

    /// The `num_bins + 1` bin edges; the last edge is exactly `upper_bound`
    pub fn edges(&self) -> Vec<f64> {
        let n = self.num_bins as usize;
        let span = self.upper_bound - self.lower_bound;
        (0..=n)
            .map(|i| {
                if i == n {
                    self.upper_bound
                } else {
                    self.lower_bound + span * i as f64 / n as f64
                }
            })
            .collect()
    }

    /// Output column name of every bin
    pub fn bin_names(&self) -> Vec<String> {
        let prefix = if self.bin_name_prefix.is_empty() {
            &self.name
        } else {
            &self.bin_name_prefix
        };
        self.edges()
            .windows(2)
            .map(|w| format!("{}_{}_{}", prefix, edge_label(w[0]), edge_label(w[1])))
            .collect()
    }

    pub fn sparkline_name(&self) -> String {
        format!("{}_sparkline", self.name)
    }

    pub fn mean_name(&self) -> String {
        format!("{}_mean", self.name)
    }

    pub fn count_name(&self) -> String {
        format!("{}_count", self.name)
    }

    /// Per-visit value: extraction, optional transform, then the raw value
    pub fn evaluate(&self, form_json: &serde_json::Value) -> Option<FieldValue> {
        let raw = extract_value(form_json, &self.paths);
        match self.transform {
            Some(t) => t.apply_opt(raw.as_ref()),
            None => raw,
        }
    }

    /// Validate name, paths, bounds and bin count
    pub fn validate(&self) -> ConfigResult<()> {
        validate_name_and_paths(&self.name, &self.paths)?;
        if !self.lower_bound.is_finite() || !self.upper_bound.is_finite() {
            return Err(ConfigError::NonFiniteBounds(self.name.clone()));
        }
        if self.lower_bound >= self.upper_bound {
            return Err(ConfigError::InvertedBounds {
                name: self.name.clone(),
                lower: self.lower_bound,
                upper: self.upper_bound,
            });
        }
        if self.num_bins == 0 {
            return Err(ConfigError::ZeroBins(self.name.clone()));
        }
        Ok(())
    }
}

/// Edge label for bin names: 2 decimals at most, `.` as `_`, `-` as `neg`
fn edge_label(edge: f64) -> String {
    let fixed = format!("{:.2}", edge);
    let trimmed = if fixed.contains('.') {
        fixed.trim_end_matches('0').trim_end_matches('.')
    } else {
        fixed.as_str()
    };
    let trimmed = if trimmed == "-0" { "0" } else { trimmed };
    trimmed.replace('-', "neg").replace('.', "_")
}

fn validate_name_and_paths(name: &str, paths: &[String]) -> ConfigResult<()> {
    if name.trim().is_empty() {
        return Err(ConfigError::EmptyName);
    }
    if paths.is_empty() {
        return Err(ConfigError::EmptyPaths(name.to_string()));
    }
    for path in paths {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ConfigError::EmptyPathSegment {
                name: name.to_string(),
                path: path.clone(),
            });
        }
    }
    Ok(())
}

/// Record filters applied before any computation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisitFilters {
    /// Allowed statuses; empty allows all
    pub statuses: BTreeSet<String>,
    /// Keep flagged visits only
    pub flagged_only: bool,
    /// Inclusive first day (UTC)
    pub date_from: Option<NaiveDate>,
    /// Inclusive last day (UTC)
    pub date_to: Option<NaiveDate>,
    /// Allowed usernames; empty allows all
    pub usernames: BTreeSet<String>,
}

impl VisitFilters {
    /// Returns true if the visit passes every filter
    pub fn matches(&self, visit: &SlimVisit) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&visit.status) {
            return false;
        }
        if self.flagged_only && !visit.flagged {
            return false;
        }
        let day = visit.visit_date.date_naive();
        if self.date_from.is_some_and(|from| day < from) {
            return false;
        }
        if self.date_to.is_some_and(|to| day > to) {
            return false;
        }
        if !self.usernames.is_empty() {
            match &visit.username {
                Some(name) if self.usernames.contains(name) => {}
                _ => return false,
            }
        }
        true
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(ConfigError::InvertedDateRange {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Column names of the standard row attributes; custom outputs may not reuse them
pub const RESERVED_NAMES: &[&str] = &[
    "grouping_value",
    "total_visits",
    "approved_visits",
    "pending_visits",
    "rejected_visits",
    "flagged_visits",
    "first_visit_date",
    "last_visit_date",
    "dataset_id",
    "visit_id",
    "visit_seq",
    "username",
    "status",
    "visit_date",
    "flagged",
    "entity_id",
    "entity_name",
    "latitude",
    "longitude",
    "accuracy",
    "form_json",
];

/// Declarative computation unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputationConfig {
    pub grouping_key: String,
    pub fields: Vec<FieldComputation>,
    pub histograms: Vec<HistogramComputation>,
    pub filters: VisitFilters,
    pub terminal_stage: TerminalStage,
}

impl ComputationConfig {
    /// Create a new config builder
    pub fn builder(grouping_key: impl Into<String>) -> ComputationConfigBuilder {
        ComputationConfigBuilder::new(grouping_key)
    }

    /// Parse and validate a JSON config document
    pub fn from_json(text: &str) -> ConfigResult<Self> {
        let doc: ConfigDocument =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        doc.into_config(&TransformRegistry::default())
    }

    /// Parse with a registry that may carry transform aliases
    pub fn from_json_with_registry(text: &str, registry: &TransformRegistry) -> ConfigResult<Self> {
        let doc: ConfigDocument =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        doc.into_config(registry)
    }

    /// Validate the whole config
    pub fn validate(&self) -> ConfigResult<()> {
        if self.grouping_key.trim().is_empty() {
            return Err(ConfigError::EmptyGroupingKey);
        }
        for field in &self.fields {
            field.validate()?;
        }
        for histogram in &self.histograms {
            histogram.validate()?;
        }
        self.filters.validate()?;

        let mut seen = HashSet::new();
        for name in self.output_names() {
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::ReservedName(name));
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateName(name));
            }
        }
        Ok(())
    }

    /// Every custom output column, fields first, then histogram columns
    pub fn output_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fields.iter().map(|f| f.name.clone()).collect();
        for h in &self.histograms {
            names.extend(h.bin_names());
            names.push(h.sparkline_name());
            names.push(h.mean_name());
            names.push(h.count_name());
        }
        names
    }

    /// Canonical serialization used for fingerprinting
    pub fn canonical_json(&self) -> String {
        // Field order is fixed by the struct definitions and every map is ordered
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Deterministic content fingerprint (hex, 32 chars)
    pub fn config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }
}

/// Builder for [`ComputationConfig`]
pub struct ComputationConfigBuilder {
    grouping_key: String,
    fields: Vec<FieldComputation>,
    histograms: Vec<HistogramComputation>,
    filters: VisitFilters,
    terminal_stage: TerminalStage,
}

impl ComputationConfigBuilder {
    /// Create a new builder; the stage defaults to [`TerminalStage::Aggregated`]
    pub fn new(grouping_key: impl Into<String>) -> Self {
        Self {
            grouping_key: grouping_key.into(),
            fields: Vec::new(),
            histograms: Vec::new(),
            filters: VisitFilters::default(),
            terminal_stage: TerminalStage::Aggregated,
        }
    }

    /// Add a field computation
    pub fn field(mut self, field: FieldComputation) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a histogram computation
    pub fn histogram(mut self, histogram: HistogramComputation) -> Self {
        self.histograms.push(histogram);
        self
    }

    /// Replace the filters
    pub fn filters(mut self, filters: VisitFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Allow a status
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.filters.statuses.insert(status.into());
        self
    }

    /// Keep flagged visits only
    pub fn flagged_only(mut self, flagged_only: bool) -> Self {
        self.filters.flagged_only = flagged_only;
        self
    }

    /// Inclusive date bounds
    pub fn date_range(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.filters.date_from = from;
        self.filters.date_to = to;
        self
    }

    /// Set the terminal stage
    pub fn terminal_stage(mut self, stage: TerminalStage) -> Self {
        self.terminal_stage = stage;
        self
    }

    /// Build and validate
    pub fn build(self) -> ConfigResult<ComputationConfig> {
        let config = ComputationConfig {
            grouping_key: self.grouping_key,
            fields: self.fields,
            histograms: self.histograms,
            filters: self.filters,
            terminal_stage: self.terminal_stage,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    grouping_key: String,
    #[serde(default)]
    fields: Vec<FieldDocument>,
    #[serde(default)]
    histograms: Vec<HistogramDocument>,
    #[serde(default)]
    filters: VisitFilters,
    #[serde(default = "default_stage")]
    terminal_stage: String,
}

fn default_stage() -> String {
    TerminalStage::Aggregated.name().to_string()
}

#[derive(Debug, Deserialize)]
struct FieldDocument {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    paths: Vec<String>,
    aggregation: String,
    #[serde(default)]
    transform: Option<String>,
    #[serde(default)]
    default: Option<FieldValue>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct HistogramDocument {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    paths: Vec<String>,
    lower_bound: f64,
    upper_bound: f64,
    num_bins: u32,
    #[serde(default)]
    bin_name_prefix: Option<String>,
    #[serde(default)]
    include_out_of_range: bool,
    #[serde(default)]
    transform: Option<String>,
    #[serde(default)]
    description: String,
}

fn merge_paths(path: Option<String>, mut paths: Vec<String>) -> Vec<String> {
    if let Some(p) = path {
        paths.insert(0, p);
    }
    paths
}

fn resolve_transform(
    name: Option<String>,
    registry: &TransformRegistry,
) -> ConfigResult<Option<Transform>> {
    name.map(|n| registry.resolve(&n).map_err(|_| ConfigError::UnknownTransform(n)))
        .transpose()
}

impl ConfigDocument {
    fn into_config(self, registry: &TransformRegistry) -> ConfigResult<ComputationConfig> {
        let terminal_stage = self.terminal_stage.parse()?;

        let fields = self
            .fields
            .into_iter()
            .map(|f| {
                Ok(FieldComputation {
                    aggregation: f.aggregation.parse()?,
                    transform: resolve_transform(f.transform, registry)?,
                    paths: merge_paths(f.path, f.paths),
                    name: f.name,
                    default: f.default,
                    description: f.description,
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        let histograms = self
            .histograms
            .into_iter()
            .map(|h| {
                Ok(HistogramComputation {
                    transform: resolve_transform(h.transform, registry)?,
                    paths: merge_paths(h.path, h.paths),
                    bin_name_prefix: h.bin_name_prefix.unwrap_or_else(|| h.name.clone()),
                    name: h.name,
                    lower_bound: h.lower_bound,
                    upper_bound: h.upper_bound,
                    num_bins: h.num_bins,
                    include_out_of_range: h.include_out_of_range,
                    description: h.description,
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        let config = ComputationConfig {
            grouping_key: self.grouping_key,
            fields,
            histograms,
            filters: self.filters,
            terminal_stage,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn age_config() -> ComputationConfig {
        ComputationConfig::builder("username")
            .field(FieldComputation::new("avg_age", "form.age", AggregationKind::Avg))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let config = age_config();
        assert_eq!(config.grouping_key, "username");
        assert_eq!(config.terminal_stage, TerminalStage::Aggregated);
        assert_eq!(config.fields.len(), 1);
    }

    #[test]
    fn test_validation_rejects_empty_name_and_paths() {
        let result = ComputationConfig::builder("username")
            .field(FieldComputation::new("", "form.age", AggregationKind::Sum))
            .build();
        assert_eq!(result, Err(ConfigError::EmptyName));

        let mut field = FieldComputation::new("x", "form.age", AggregationKind::Sum);
        field.paths.clear();
        let result = ComputationConfig::builder("username").field(field).build();
        assert_eq!(result, Err(ConfigError::EmptyPaths("x".to_string())));

        let result = ComputationConfig::builder("username")
            .field(FieldComputation::new("x", "form..age", AggregationKind::Sum))
            .build();
        assert!(matches!(result, Err(ConfigError::EmptyPathSegment { .. })));
    }

    #[test]
    fn test_validation_rejects_bad_histograms() {
        let result = ComputationConfig::builder("username")
            .histogram(HistogramComputation::new("h", "form.v", 10.0, 0.0, 2))
            .build();
        assert!(matches!(result, Err(ConfigError::InvertedBounds { .. })));

        let result = ComputationConfig::builder("username")
            .histogram(HistogramComputation::new("h", "form.v", 0.0, 10.0, 0))
            .build();
        assert_eq!(result, Err(ConfigError::ZeroBins("h".to_string())));

        let result = ComputationConfig::builder("username")
            .histogram(HistogramComputation::new("h", "form.v", 0.0, f64::INFINITY, 2))
            .build();
        assert_eq!(result, Err(ConfigError::NonFiniteBounds("h".to_string())));
    }

    #[test]
    fn test_validation_rejects_duplicates() {
        let result = ComputationConfig::builder("username")
            .field(FieldComputation::new("a", "form.x", AggregationKind::Sum))
            .field(FieldComputation::new("a", "form.y", AggregationKind::Count))
            .build();
        assert_eq!(result, Err(ConfigError::DuplicateName("a".to_string())));

        let result = ComputationConfig::builder("username")
            .field(FieldComputation::new("h_count", "form.x", AggregationKind::Count))
            .histogram(HistogramComputation::new("h", "form.v", 0.0, 10.0, 2))
            .build();
        assert_eq!(result, Err(ConfigError::DuplicateName("h_count".to_string())));
    }

    #[test]
    fn test_validation_rejects_reserved_names() {
        let result = ComputationConfig::builder("username")
            .field(FieldComputation::new("total_visits", "form.x", AggregationKind::Count))
            .build();
        assert_eq!(result, Err(ConfigError::ReservedName("total_visits".to_string())));
    }

    #[test]
    fn test_validation_rejects_empty_grouping_key() {
        assert_eq!(
            ComputationConfig::builder(" ").build(),
            Err(ConfigError::EmptyGroupingKey)
        );
    }

    #[test]
    fn test_bin_names_and_edges() {
        let h = HistogramComputation::new("muac", "form.muac", 9.5, 13.5, 4).prefix("muac");
        assert_eq!(h.bin_width(), 1.0);
        assert_eq!(h.edges(), vec![9.5, 10.5, 11.5, 12.5, 13.5]);
        assert_eq!(
            h.bin_names(),
            vec!["muac_9_5_10_5", "muac_10_5_11_5", "muac_11_5_12_5", "muac_12_5_13_5"]
        );

        let h = HistogramComputation::new("t", "form.t", -5.0, 5.0, 2);
        assert_eq!(h.bin_names(), vec!["t_neg5_0", "t_0_5"]);
    }

    #[test]
    fn test_config_hash_is_stable_and_content_based() {
        let a = age_config();
        let b = age_config();
        assert_eq!(a.config_hash(), b.config_hash());
        assert_eq!(a.config_hash().len(), 32);

        let c = ComputationConfig::builder("username")
            .field(FieldComputation::new("avg_age", "form.age", AggregationKind::Sum))
            .build()
            .unwrap();
        assert_ne!(a.config_hash(), c.config_hash());
    }

    #[test]
    fn test_config_hash_ignores_filter_insertion_order() {
        let a = ComputationConfig::builder("username")
            .status("approved")
            .status("pending")
            .build()
            .unwrap();
        let b = ComputationConfig::builder("username")
            .status("pending")
            .status("approved")
            .build()
            .unwrap();
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn test_from_json() {
        let config = ComputationConfig::from_json(
            r#"{
                "grouping_key": "username",
                "terminal_stage": "VisitLevel",
                "fields": [
                    {"name": "age", "path": "form.age", "paths": ["form.old_age"], "aggregation": "avg", "default": 0},
                    {"name": "sick", "path": "form.sick", "aggregation": "count", "transform": "yes_flag"}
                ],
                "histograms": [
                    {"name": "muac", "path": "form.muac", "lower_bound": 9.5, "upper_bound": 13.5, "num_bins": 4}
                ],
                "filters": {"statuses": ["approved"], "flagged_only": true}
            }"#,
        )
        .unwrap();

        assert_eq!(config.terminal_stage, TerminalStage::VisitLevel);
        assert_eq!(config.fields[0].paths, vec!["form.age", "form.old_age"]);
        assert_eq!(config.fields[0].default, Some(FieldValue::Integer(0)));
        assert_eq!(config.fields[1].transform, Some(Transform::YesFlag));
        assert_eq!(config.histograms[0].bin_name_prefix, "muac");
        assert!(config.filters.flagged_only);
    }

    #[test]
    fn test_from_json_roundtrips_serialized_config() {
        let config = ComputationConfig::builder("username")
            .field(
                FieldComputation::new("sick", "form.sick", AggregationKind::Count)
                    .transform(Transform::YesFlag)
                    .default_value(0i64),
            )
            .histogram(HistogramComputation::new("h", "form.v", 0.0, 10.0, 2).include_out_of_range(true))
            .terminal_stage(TerminalStage::VisitLevel)
            .build()
            .unwrap();
        let reparsed = ComputationConfig::from_json(&config.canonical_json()).unwrap();
        assert_eq!(reparsed, config);
        assert_eq!(reparsed.config_hash(), config.config_hash());
    }

    #[test]
    fn test_from_json_rejects_unknown_kinds() {
        let bad_agg = r#"{"grouping_key": "u", "fields": [{"name": "a", "path": "x", "aggregation": "median"}]}"#;
        assert_eq!(
            ComputationConfig::from_json(bad_agg),
            Err(ConfigError::UnknownAggregation("median".to_string()))
        );

        let bad_stage = r#"{"grouping_key": "u", "terminal_stage": "weekly"}"#;
        assert_eq!(
            ComputationConfig::from_json(bad_stage),
            Err(ConfigError::UnknownTerminalStage("weekly".to_string()))
        );

        let bad_transform = r#"{"grouping_key": "u", "fields": [{"name": "a", "path": "x", "aggregation": "sum", "transform": "magic"}]}"#;
        assert_eq!(
            ComputationConfig::from_json(bad_transform),
            Err(ConfigError::UnknownTransform("magic".to_string()))
        );
    }

    #[test]
    fn test_filters_match() {
        let date = Utc.with_ymd_and_hms(2024, 5, 10, 23, 0, 0).unwrap();
        let mut visit = SlimVisit::new("v1", "alice", "approved", date);

        let mut filters = VisitFilters::default();
        assert!(filters.matches(&visit));

        filters.statuses.insert("pending".to_string());
        assert!(!filters.matches(&visit));
        filters.statuses.insert("approved".to_string());
        assert!(filters.matches(&visit));

        filters.flagged_only = true;
        assert!(!filters.matches(&visit));
        visit.flagged = true;
        assert!(filters.matches(&visit));

        filters.date_to = NaiveDate::from_ymd_opt(2024, 5, 10);
        assert!(filters.matches(&visit));
        filters.date_from = NaiveDate::from_ymd_opt(2024, 5, 11);
        assert!(!filters.matches(&visit));
    }

    #[test]
    fn test_inverted_date_filter_rejected() {
        let result = ComputationConfig::builder("username")
            .date_range(NaiveDate::from_ymd_opt(2024, 2, 1), NaiveDate::from_ymd_opt(2024, 1, 1))
            .build();
        assert!(matches!(result, Err(ConfigError::InvertedDateRange { .. })));
    }
}
