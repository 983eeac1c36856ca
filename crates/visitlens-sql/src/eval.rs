//! Direct evaluation of query plans over visit records
//!
//! Follows SQL semantics for the constructs the renderer emits: an absent
//! operand makes a predicate false, reducers skip absent values, and an empty
//! reduction is NULL except for counts.

use crate::expr::{AggExpr, Column, Expr, Predicate};
use crate::store::{SqlValue, StoreRow};
use crate::translator::{columns, PlanShape, QueryPlan};
use chrono::{DateTime, NaiveDate, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use visitlens_core::transform::normalized_text;
use visitlens_core::{extract, is_non_blank, round2, VisitRecord};

struct Row<'a> {
    dataset_id: &'a str,
    record: &'a VisitRecord,
}

/// Evaluate a plan over one dataset's records
pub(crate) fn evaluate(plan: &QueryPlan, records: &[VisitRecord]) -> Vec<StoreRow> {
    let mut rows: Vec<Row<'_>> = records
        .iter()
        .map(|record| Row {
            dataset_id: &plan.dataset_id,
            record,
        })
        .filter(|row| predicate(&plan.filter, row))
        .collect();
    rows.sort_by_key(|row| row.record.visit.order_key());

    match &plan.shape {
        PlanShape::Visits { fields } => rows
            .iter()
            .map(|row| {
                let mut out: StoreRow = Column::VISIT_ATTRIBUTES
                    .iter()
                    .map(|c| (c.name().to_string(), column(*c, row)))
                    .collect();
                for (name, expr) in fields {
                    out.insert(name.clone(), value(expr, row));
                }
                out
            })
            .collect(),
        PlanShape::Groups { key, columns: outputs } => {
            let mut groups: BTreeMap<String, Vec<&Row<'_>>> = BTreeMap::new();
            for row in &rows {
                if let Some(k) = value(key, row).to_field_value() {
                    groups.entry(k.to_text()).or_default().push(row);
                }
            }
            groups
                .into_iter()
                .map(|(k, members)| {
                    let mut out = StoreRow::new();
                    out.insert(columns::GROUPING_VALUE.to_string(), SqlValue::Text(k));
                    for output in outputs {
                        out.insert(output.alias.clone(), aggregate(&output.agg, &members));
                    }
                    out
                })
                .collect()
        }
    }
}

fn column(c: Column, row: &Row<'_>) -> SqlValue {
    let visit = &row.record.visit;
    match c {
        Column::DatasetId => SqlValue::Text(row.dataset_id.to_string()),
        Column::VisitId => SqlValue::Text(visit.visit_id.clone()),
        Column::VisitSeq => SqlValue::Int(visit.ordinal as i64),
        Column::Username => visit.username.clone().into(),
        Column::Status => SqlValue::Text(visit.status.clone()),
        Column::Flagged => SqlValue::Bool(visit.flagged),
        Column::VisitDate => SqlValue::Timestamp(visit.visit_date),
        Column::EntityId => visit.entity_id.clone().into(),
        Column::EntityName => visit.entity_name.clone().into(),
        Column::Latitude => visit.latitude.into(),
        Column::Longitude => visit.longitude.into(),
        Column::Accuracy => visit.accuracy.into(),
        Column::FormJson => SqlValue::Json(row.record.form_json.clone()),
    }
}

fn value(expr: &Expr, row: &Row<'_>) -> SqlValue {
    match expr {
        Expr::Column(c) => column(*c, row),
        Expr::JsonPath(segments) => match extract(&row.record.form_json, &segments.join(".")) {
            Some(v) if !v.is_null() => SqlValue::Json(v.clone()),
            _ => SqlValue::Null,
        },
        Expr::Coalesce(items) => items
            .iter()
            .map(|item| value(item, row))
            .find(|v| !v.is_null())
            .unwrap_or(SqlValue::Null),
        Expr::Text(inner) => match value(inner, row).to_field_value() {
            Some(v) => SqlValue::Text(v.to_text()),
            None => SqlValue::Null,
        },
        Expr::NormText(inner) => match value(inner, row).to_field_value() {
            Some(v) => SqlValue::Text(normalized_text(&v)),
            None => SqlValue::Null,
        },
        Expr::Numeric(inner) => number(inner, row).map_or(SqlValue::Null, SqlValue::Number),
        Expr::Flag(pred) => {
            if predicate(pred, row) {
                SqlValue::Int(1)
            } else {
                SqlValue::Null
            }
        }
    }
}

fn number(expr: &Expr, row: &Row<'_>) -> Option<f64> {
    value(expr, row).to_field_value().and_then(|v| v.coerce_f64())
}

fn text_column(c: Column, row: &Row<'_>) -> Option<String> {
    match column(c, row) {
        SqlValue::Text(s) => Some(s),
        _ => None,
    }
}

fn timestamp_column(c: Column, row: &Row<'_>) -> Option<DateTime<Utc>> {
    match column(c, row) {
        SqlValue::Timestamp(t) => Some(t),
        _ => None,
    }
}

fn day_start(day: NaiveDate) -> Option<DateTime<Utc>> {
    day.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc())
}

fn predicate(pred: &Predicate, row: &Row<'_>) -> bool {
    match pred {
        Predicate::True => true,
        Predicate::And(terms) => terms.iter().all(|t| predicate(t, row)),
        Predicate::IsPresent(expr) => !value(expr, row).is_null(),
        Predicate::Equals(c, expected) => text_column(*c, row).is_some_and(|s| &s == expected),
        Predicate::InList(c, values) => text_column(*c, row).is_some_and(|s| values.contains(&s)),
        Predicate::EqualsIgnoreCase(c, expected) => {
            text_column(*c, row).is_some_and(|s| s.eq_ignore_ascii_case(expected))
        }
        Predicate::IsTrue(c) => matches!(column(*c, row), SqlValue::Bool(true)),
        Predicate::OnOrAfterDay(c, day) => match (timestamp_column(*c, row), day_start(*day)) {
            (Some(t), Some(start)) => t >= start,
            _ => false,
        },
        Predicate::BeforeDay(c, day) => match (timestamp_column(*c, row), day_start(*day)) {
            (Some(t), Some(start)) => t < start,
            _ => false,
        },
        Predicate::TextIn(expr, values) => match value(expr, row) {
            SqlValue::Text(s) => values.contains(&s),
            _ => false,
        },
        Predicate::NonBlank(expr) => value(expr, row)
            .to_field_value()
            .is_some_and(|v| is_non_blank(&v.to_text())),
        Predicate::IsNumeric(expr) => number(expr, row).is_some(),
        Predicate::Compare(expr, op, rhs) => number(expr, row).is_some_and(|v| op.holds(v, *rhs)),
    }
}

fn aggregate(agg: &AggExpr, rows: &[&Row<'_>]) -> SqlValue {
    match agg {
        AggExpr::CountRows => SqlValue::Int(rows.len() as i64),
        AggExpr::CountWhere(pred) => {
            SqlValue::Int(rows.iter().filter(|row| predicate(pred, row)).count() as i64)
        }
        AggExpr::Count(expr) => SqlValue::Int(present(expr, rows).len() as i64),
        AggExpr::Sum(expr) => {
            let nums = numbers(expr, rows);
            if nums.is_empty() {
                SqlValue::Null
            } else {
                SqlValue::Number(nums.iter().sum::<f64>())
            }
        }
        AggExpr::RoundedAvg(expr) => {
            let nums = numbers(expr, rows);
            if nums.is_empty() {
                SqlValue::Null
            } else {
                SqlValue::Number(round2(nums.iter().sum::<f64>() / nums.len() as f64))
            }
        }
        AggExpr::Min(expr) => extreme(present(expr, rows), Ordering::Less),
        AggExpr::Max(expr) => extreme(present(expr, rows), Ordering::Greater),
        AggExpr::OrderedValues(expr) => {
            let values = present(expr, rows);
            if values.is_empty() {
                SqlValue::Null
            } else {
                SqlValue::Array(values)
            }
        }
    }
}

fn present(expr: &Expr, rows: &[&Row<'_>]) -> Vec<SqlValue> {
    rows.iter()
        .map(|row| value(expr, row))
        .filter(|v| !v.is_null())
        .collect()
}

fn numbers(expr: &Expr, rows: &[&Row<'_>]) -> Vec<f64> {
    present(expr, rows).iter().filter_map(SqlValue::as_f64).collect()
}

fn extreme(values: Vec<SqlValue>, want: Ordering) -> SqlValue {
    if values.iter().all(|v| matches!(v, SqlValue::Number(_) | SqlValue::Int(_))) {
        let pick: fn(f64, f64) -> f64 = if want == Ordering::Less { f64::min } else { f64::max };
        return values
            .iter()
            .filter_map(SqlValue::as_f64)
            .reduce(pick)
            .map_or(SqlValue::Null, SqlValue::Number);
    }

    values
        .into_iter()
        .reduce(|best, v| if compare(&v, &best) == Some(want) { v } else { best })
        .unwrap_or(SqlValue::Null)
}

fn compare(a: &SqlValue, b: &SqlValue) -> Option<Ordering> {
    match (a, b) {
        (SqlValue::Timestamp(x), SqlValue::Timestamp(y)) => Some(x.cmp(y)),
        (SqlValue::Text(x), SqlValue::Text(y)) => Some(x.cmp(y)),
        (SqlValue::Bool(x), SqlValue::Bool(y)) => Some(x.cmp(y)),
        _ => a.as_f64().zip(b.as_f64()).and_then(|(x, y)| x.partial_cmp(&y)),
    }
}
