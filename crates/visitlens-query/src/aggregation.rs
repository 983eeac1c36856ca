//! Aggregation engine
//!
//! Reduces the per-visit values of one field within a group. Only present
//! values take part; when nothing survives the reduction the configured
//! default is returned instead. Both backends finish order-sensitive kinds
//! through this module, so its output is the cross-backend reference.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use visitlens_core::{round2, FieldValue};

/// Supported aggregation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// Sum of numeric values
    Sum,
    /// Mean of numeric values, rounded to 2 decimals
    Avg,
    /// Count of present values
    Count,
    /// Count of distinct present values
    CountUnique,
    /// Minimum numeric value
    Min,
    /// Maximum numeric value
    Max,
    /// Distinct present values in encounter order
    List,
    /// First present value (by visit date, then batch order)
    First,
    /// Last present value (by visit date, then batch order)
    Last,
}

impl AggregationKind {
    /// Every kind, in declaration order
    pub const ALL: [AggregationKind; 9] = [
        AggregationKind::Sum,
        AggregationKind::Avg,
        AggregationKind::Count,
        AggregationKind::CountUnique,
        AggregationKind::Min,
        AggregationKind::Max,
        AggregationKind::List,
        AggregationKind::First,
        AggregationKind::Last,
    ];

    /// Canonical name used in configs
    pub fn name(&self) -> &'static str {
        match self {
            AggregationKind::Sum => "sum",
            AggregationKind::Avg => "avg",
            AggregationKind::Count => "count",
            AggregationKind::CountUnique => "count_unique",
            AggregationKind::Min => "min",
            AggregationKind::Max => "max",
            AggregationKind::List => "list",
            AggregationKind::First => "first",
            AggregationKind::Last => "last",
        }
    }

    /// True when the kind reduces over numeric coercions of the values
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            AggregationKind::Sum | AggregationKind::Avg | AggregationKind::Min | AggregationKind::Max
        )
    }

    /// True when the result depends on the order values are seen in
    pub fn is_order_sensitive(&self) -> bool {
        matches!(
            self,
            AggregationKind::First | AggregationKind::Last | AggregationKind::List
        )
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggregationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "sum" => Ok(AggregationKind::Sum),
            "avg" | "mean" | "average" => Ok(AggregationKind::Avg),
            "count" => Ok(AggregationKind::Count),
            "count_unique" | "count_distinct" => Ok(AggregationKind::CountUnique),
            "min" => Ok(AggregationKind::Min),
            "max" => Ok(AggregationKind::Max),
            "list" => Ok(AggregationKind::List),
            "first" => Ok(AggregationKind::First),
            "last" => Ok(AggregationKind::Last),
            _ => Err(ConfigError::UnknownAggregation(s.to_string())),
        }
    }
}

/// Aggregator for computing one aggregate value
pub struct Aggregator {
    kind: AggregationKind,
    values: Vec<FieldValue>,
}

impl Aggregator {
    /// Create a new aggregator
    pub fn new(kind: AggregationKind) -> Self {
        Self {
            kind,
            values: Vec::new(),
        }
    }

    /// Add a value; absent values are skipped
    pub fn add(&mut self, value: Option<FieldValue>) {
        if let Some(v) = value {
            self.values.push(v);
        }
    }

    /// Add multiple values
    pub fn add_all(&mut self, values: impl IntoIterator<Item = Option<FieldValue>>) {
        for v in values {
            self.add(v);
        }
    }

    /// Compute the aggregate, substituting `default` for an empty reduction
    pub fn result(&self, default: Option<&FieldValue>) -> Option<FieldValue> {
        finalize(self.kind, reduce(self.kind, &self.values), default)
    }

    /// Reset the aggregator
    pub fn reset(&mut self) {
        self.values.clear();
    }

    /// Get the number of present values
    pub fn count(&self) -> usize {
        self.values.len()
    }
}

/// Reduce values without a default
pub fn aggregate(kind: AggregationKind, values: &[Option<FieldValue>]) -> Option<FieldValue> {
    let present: Vec<FieldValue> = values.iter().flatten().cloned().collect();
    reduce(kind, &present)
}

/// Reduce values, substituting `default` when the reduction is empty
pub fn aggregate_with_default(
    kind: AggregationKind,
    values: &[Option<FieldValue>],
    default: Option<&FieldValue>,
) -> Option<FieldValue> {
    let mut agg = Aggregator::new(kind);
    agg.add_all(values.iter().cloned());
    agg.result(default)
}

/// Substitute `default` for an empty reduction. Counts fall back to zero when
/// no default is configured.
pub fn finalize(
    kind: AggregationKind,
    reduced: Option<FieldValue>,
    default: Option<&FieldValue>,
) -> Option<FieldValue> {
    reduced.or_else(|| match kind {
        AggregationKind::Count | AggregationKind::CountUnique => {
            Some(default.cloned().unwrap_or(FieldValue::Integer(0)))
        }
        _ => default.cloned(),
    })
}

/// Core reduction over present values. `None` means the reduction was empty.
fn reduce(kind: AggregationKind, values: &[FieldValue]) -> Option<FieldValue> {
    if values.is_empty() {
        return None;
    }

    match kind {
        AggregationKind::Count => Some(FieldValue::Integer(values.len() as i64)),

        AggregationKind::CountUnique => Some(FieldValue::Integer(count_unique(values) as i64)),

        AggregationKind::Sum => {
            let nums = numeric(values);
            if nums.is_empty() {
                return None;
            }
            Some(FieldValue::Float(nums.iter().sum()))
        }

        AggregationKind::Avg => {
            let nums = numeric(values);
            if nums.is_empty() {
                return None;
            }
            let sum: f64 = nums.iter().sum();
            Some(FieldValue::Float(round2(sum / nums.len() as f64)))
        }

        AggregationKind::Min => numeric(values)
            .into_iter()
            .reduce(f64::min)
            .map(FieldValue::Float),

        AggregationKind::Max => numeric(values)
            .into_iter()
            .reduce(f64::max)
            .map(FieldValue::Float),

        AggregationKind::First => values.first().cloned(),

        AggregationKind::Last => values.last().cloned(),

        AggregationKind::List => Some(FieldValue::List(distinct(values))),
    }
}

fn numeric(values: &[FieldValue]) -> Vec<f64> {
    values.iter().filter_map(FieldValue::coerce_f64).collect()
}

fn count_unique(values: &[FieldValue]) -> usize {
    let mut seen = HashSet::with_capacity(values.len());
    for value in values {
        match value.dedupe_key() {
            Some(key) => {
                seen.insert(key);
            }
            None => {
                // Lists are not comparable: fall back to the raw count
                debug!(count = values.len(), "count_unique over non-comparable values");
                return values.len();
            }
        }
    }
    seen.len()
}

fn distinct(values: &[FieldValue]) -> Vec<FieldValue> {
    let mut seen_keys = HashSet::new();
    let mut out: Vec<FieldValue> = Vec::new();
    for value in values {
        let fresh = match value.dedupe_key() {
            Some(key) => seen_keys.insert(key),
            None => !out.contains(value),
        };
        if fresh {
            out.push(value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[Option<i64>]) -> Vec<Option<FieldValue>> {
        values.iter().map(|v| v.map(FieldValue::Integer)).collect()
    }

    fn text(v: &str) -> Option<FieldValue> {
        Some(FieldValue::String(v.to_string()))
    }

    #[test]
    fn test_count_skips_absent() {
        let values = ints(&[Some(1), None, Some(3)]);
        assert_eq!(aggregate(AggregationKind::Count, &values), Some(FieldValue::Integer(2)));
    }

    #[test]
    fn test_count_empty_defaults_to_zero() {
        assert_eq!(
            aggregate_with_default(AggregationKind::Count, &[None], None),
            Some(FieldValue::Integer(0))
        );
        assert_eq!(
            aggregate_with_default(AggregationKind::Count, &[], Some(&FieldValue::Integer(-1))),
            Some(FieldValue::Integer(-1))
        );
    }

    #[test]
    fn test_sum_empty_uses_default() {
        let default = FieldValue::Integer(0);
        assert_eq!(
            aggregate_with_default(AggregationKind::Sum, &[], Some(&default)),
            Some(FieldValue::Integer(0))
        );
    }

    #[test]
    fn test_sum_coerces_numeric_text() {
        let values = vec![text("1.5"), Some(FieldValue::Integer(2)), text("abc")];
        assert_eq!(aggregate(AggregationKind::Sum, &values), Some(FieldValue::Float(3.5)));
    }

    #[test]
    fn test_sum_with_nothing_numeric_is_empty() {
        let values = vec![text("abc"), text("def")];
        assert_eq!(aggregate(AggregationKind::Sum, &values), None);
        assert_eq!(
            aggregate_with_default(AggregationKind::Sum, &values, Some(&FieldValue::Float(0.0))),
            Some(FieldValue::Float(0.0))
        );
    }

    #[test]
    fn test_avg_rounds_to_two_decimals() {
        let values = ints(&[Some(1), Some(1), Some(2)]);
        assert_eq!(aggregate(AggregationKind::Avg, &values), Some(FieldValue::Float(1.33)));

        let values = ints(&[Some(10), None, Some(20)]);
        assert_eq!(aggregate(AggregationKind::Avg, &values), Some(FieldValue::Float(15.0)));
    }

    #[test]
    fn test_min_max() {
        let values = vec![text("5"), Some(FieldValue::Float(2.5)), Some(FieldValue::Integer(8)), None];
        assert_eq!(aggregate(AggregationKind::Min, &values), Some(FieldValue::Float(2.5)));
        assert_eq!(aggregate(AggregationKind::Max, &values), Some(FieldValue::Float(8.0)));
    }

    #[test]
    fn test_first_last_skip_absent() {
        let values = vec![None, text("a"), text("b"), None];
        assert_eq!(aggregate(AggregationKind::First, &values), text("a"));
        assert_eq!(aggregate(AggregationKind::Last, &values), text("b"));
    }

    #[test]
    fn test_first_all_absent_returns_default() {
        let default = FieldValue::String("none".to_string());
        assert_eq!(
            aggregate_with_default(AggregationKind::First, &[None, None], Some(&default)),
            Some(default.clone())
        );
        assert_eq!(aggregate_with_default(AggregationKind::First, &[None, None], None), None);
    }

    #[test]
    fn test_count_unique() {
        let values = vec![text("a"), text("b"), text("a"), Some(FieldValue::Integer(1)), text("1")];
        assert_eq!(aggregate(AggregationKind::CountUnique, &values), Some(FieldValue::Integer(4)));
    }

    #[test]
    fn test_count_unique_falls_back_for_lists() {
        let list = Some(FieldValue::List(vec![FieldValue::Integer(1)]));
        let values = vec![list.clone(), list, text("a")];
        assert_eq!(aggregate(AggregationKind::CountUnique, &values), Some(FieldValue::Integer(3)));
    }

    #[test]
    fn test_list_dedupes_in_encounter_order() {
        let values = vec![text("b"), None, text("a"), text("b"), text("c")];
        assert_eq!(
            aggregate(AggregationKind::List, &values),
            Some(FieldValue::List(vec![
                FieldValue::String("b".into()),
                FieldValue::String("a".into()),
                FieldValue::String("c".into()),
            ]))
        );
    }

    #[test]
    fn test_aggregator_reset() {
        let mut agg = Aggregator::new(AggregationKind::Count);
        agg.add(Some(FieldValue::Integer(1)));
        agg.add(None);
        assert_eq!(agg.count(), 1);
        agg.reset();
        assert_eq!(agg.count(), 0);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("AVG".parse::<AggregationKind>().unwrap(), AggregationKind::Avg);
        assert_eq!("mean".parse::<AggregationKind>().unwrap(), AggregationKind::Avg);
        assert_eq!("count_unique".parse::<AggregationKind>().unwrap(), AggregationKind::CountUnique);
        for kind in AggregationKind::ALL {
            assert_eq!(kind.name().parse::<AggregationKind>().unwrap(), kind);
        }
        assert_eq!(
            "median".parse::<AggregationKind>(),
            Err(ConfigError::UnknownAggregation("median".to_string()))
        );
    }
}
