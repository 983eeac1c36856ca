//! Transform and aggregation lowering
//!
//! Maps the closed transform set and the aggregation kinds onto expression
//! nodes. Thresholds and synonym sets come from `visitlens_core`, the same
//! constants the in-process transforms read.

use crate::expr::{AggExpr, CompareOp, Expr, Predicate};
use visitlens_core::transform::thresholds;
use visitlens_core::Transform;
use visitlens_query::AggregationKind;

/// Lowering rules for transforms and reducers
pub struct FunctionRegistry;

impl FunctionRegistry {
    /// Expression applying `transform` to `value`
    pub fn transform(transform: Transform, value: Expr) -> Expr {
        match transform {
            Transform::YesFlag => Expr::flag(text_in(value, thresholds::YES_VALUES)),
            Transform::GenderMale => Expr::flag(text_in(value, thresholds::MALE_VALUES)),
            Transform::GenderFemale => Expr::flag(text_in(value, thresholds::FEMALE_VALUES)),
            Transform::NonBlank => Expr::flag(Predicate::NonBlank(value)),
            Transform::NumericValidity => Expr::flag(Predicate::IsNumeric(value)),
            Transform::Numeric => value.numeric(),
            Transform::BelowCutoff => Expr::flag(Predicate::Compare(
                value.numeric(),
                CompareOp::Lt,
                thresholds::LOW_CUTOFF,
            )),
            Transform::WithinBand => {
                let number = value.numeric();
                Expr::flag(Predicate::and(vec![
                    Predicate::Compare(number.clone(), CompareOp::Ge, thresholds::LOW_CUTOFF),
                    Predicate::Compare(number, CompareOp::Lt, thresholds::BAND_UPPER),
                ]))
            }
        }
    }

    /// Reducer for an aggregation kind.
    ///
    /// Numeric kinds and `count` reduce in the store. The others return the
    /// ordered present values and are finished by the row decoder.
    pub fn aggregate(kind: AggregationKind, value: Expr) -> AggExpr {
        match kind {
            AggregationKind::Count => AggExpr::Count(value),
            AggregationKind::Sum => AggExpr::Sum(value.numeric()),
            AggregationKind::Avg => AggExpr::RoundedAvg(value.numeric()),
            AggregationKind::Min => AggExpr::Min(value.numeric()),
            AggregationKind::Max => AggExpr::Max(value.numeric()),
            AggregationKind::CountUnique
            | AggregationKind::List
            | AggregationKind::First
            | AggregationKind::Last => AggExpr::OrderedValues(value),
        }
    }

    /// True when the decoder, not the store, completes the reduction
    pub fn finished_by_decoder(kind: AggregationKind) -> bool {
        matches!(Self::aggregate(kind, Expr::path("v")), AggExpr::OrderedValues(_))
    }
}

fn text_in(value: Expr, candidates: &[&str]) -> Predicate {
    Predicate::TextIn(
        value.norm_text(),
        candidates.iter().map(|c| c.to_string()).collect(),
    )
}
