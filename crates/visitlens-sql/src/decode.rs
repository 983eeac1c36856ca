//! Store row decoding
//!
//! Turns rows returned by a [`RelationalStore`](crate::RelationalStore) back
//! into [`ResultRows`]. Order-sensitive reducers arrive as ordered value
//! arrays and are finished here with the in-process reducers, so both
//! backends share one definition of `first`, `last`, `list` and
//! `count_unique`.

use crate::error::{Result, SqlError};
use crate::expr::Column;
use crate::functions::FunctionRegistry;
use crate::store::{SqlValue, StoreRow};
use crate::translator::columns;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use visitlens_core::FieldValue;
use visitlens_query::{
    aggregate, finalize, sparkline, AggregationKind, ComputationConfig, FieldComputation, FlwRow,
    HistogramComputation, HistogramResult, ResultRows, TerminalStage, VisitRow,
};

/// Decode store rows for `config`
pub fn decode_rows(config: &ComputationConfig, rows: &[StoreRow]) -> Result<ResultRows> {
    match config.terminal_stage {
        TerminalStage::VisitLevel => rows
            .iter()
            .map(|row| visit_row(config, row))
            .collect::<Result<Vec<_>>>()
            .map(ResultRows::Visits),
        TerminalStage::Aggregated => {
            let mut decoded = rows
                .iter()
                .map(|row| worker_row(config, row))
                .collect::<Result<Vec<_>>>()?;
            decoded.sort_by(|a, b| a.grouping_value.cmp(&b.grouping_value));
            Ok(ResultRows::Workers(decoded))
        }
    }
}

fn visit_row(config: &ComputationConfig, row: &StoreRow) -> Result<VisitRow> {
    let mut out = VisitRow {
        visit_id: required_text(row, Column::VisitId.name())?,
        username: optional_text(row, Column::Username.name())?,
        status: required_text(row, Column::Status.name())?,
        visit_date: required_timestamp(row, Column::VisitDate.name())?,
        flagged: matches!(cell(row, Column::Flagged.name())?, SqlValue::Bool(true)),
        entity_id: optional_text(row, Column::EntityId.name())?,
        entity_name: optional_text(row, Column::EntityName.name())?,
        latitude: optional_number(row, Column::Latitude.name())?,
        longitude: optional_number(row, Column::Longitude.name())?,
        accuracy: optional_number(row, Column::Accuracy.name())?,
        computed: BTreeMap::new(),
    };

    for field in &config.fields {
        let value = cell(row, &field.name)?
            .to_field_value()
            .or_else(|| field.default.clone());
        out.computed.insert(field.name.clone(), value);
    }
    Ok(out)
}

fn worker_row(config: &ComputationConfig, row: &StoreRow) -> Result<FlwRow> {
    let mut out = FlwRow {
        grouping_value: required_text(row, columns::GROUPING_VALUE)?,
        total_visits: count(row, columns::TOTAL_VISITS)?,
        approved_visits: count(row, columns::APPROVED_VISITS)?,
        pending_visits: count(row, columns::PENDING_VISITS)?,
        rejected_visits: count(row, columns::REJECTED_VISITS)?,
        flagged_visits: count(row, columns::FLAGGED_VISITS)?,
        first_visit_date: optional_timestamp(row, columns::FIRST_VISIT_DATE)?,
        last_visit_date: optional_timestamp(row, columns::LAST_VISIT_DATE)?,
        custom_fields: BTreeMap::new(),
    };

    for field in &config.fields {
        let value = field_result(field, cell(row, &field.name)?)?;
        out.custom_fields.insert(field.name.clone(), value);
    }

    for histogram in &config.histograms {
        for (name, value) in histogram_result(histogram, row)?.into_fields(histogram) {
            out.custom_fields.insert(name, value);
        }
    }
    Ok(out)
}

fn field_result(field: &FieldComputation, value: &SqlValue) -> Result<Option<FieldValue>> {
    let kind = field.aggregation;
    let reduced = if FunctionRegistry::finished_by_decoder(kind) {
        match value {
            SqlValue::Null => None,
            SqlValue::Array(items) => {
                let values: Vec<Option<FieldValue>> =
                    items.iter().map(SqlValue::to_field_value).collect();
                aggregate(kind, &values)
            }
            other => return Err(mistyped(&field.name, "array", other)),
        }
    } else if kind == AggregationKind::Count {
        let n = value
            .as_i64()
            .ok_or_else(|| mistyped(&field.name, "integer", value))?;
        (n > 0).then_some(FieldValue::Integer(n))
    } else {
        match value {
            SqlValue::Null => None,
            other => Some(FieldValue::Float(
                other.as_f64().ok_or_else(|| mistyped(&field.name, "number", other))?,
            )),
        }
    };
    Ok(finalize(kind, reduced, field.default.as_ref()))
}

fn histogram_result(histogram: &HistogramComputation, row: &StoreRow) -> Result<HistogramResult> {
    let bin_counts = histogram
        .bin_names()
        .iter()
        .map(|name| count(row, name))
        .collect::<Result<Vec<u64>>>()?;
    let mean = optional_number(row, &histogram.mean_name())?;
    let count = count(row, &histogram.count_name())?;

    Ok(HistogramResult {
        sparkline: sparkline(&bin_counts),
        bin_counts,
        mean,
        count,
    })
}

fn cell<'a>(row: &'a StoreRow, name: &str) -> Result<&'a SqlValue> {
    row.get(name)
        .ok_or_else(|| SqlError::Decode(format!("missing column '{}'", name)))
}

fn mistyped(name: &str, expected: &str, got: &SqlValue) -> SqlError {
    SqlError::Decode(format!("column '{}': expected {}, got {:?}", name, expected, got))
}

fn optional_text(row: &StoreRow, name: &str) -> Result<Option<String>> {
    match cell(row, name)? {
        SqlValue::Null => Ok(None),
        SqlValue::Text(s) => Ok(Some(s.clone())),
        other => Err(mistyped(name, "text", other)),
    }
}

fn required_text(row: &StoreRow, name: &str) -> Result<String> {
    optional_text(row, name)?.ok_or_else(|| SqlError::Decode(format!("column '{}' is null", name)))
}

fn optional_number(row: &StoreRow, name: &str) -> Result<Option<f64>> {
    match cell(row, name)? {
        SqlValue::Null => Ok(None),
        other => other.as_f64().map(Some).ok_or_else(|| mistyped(name, "number", other)),
    }
}

fn optional_timestamp(row: &StoreRow, name: &str) -> Result<Option<DateTime<Utc>>> {
    match cell(row, name)? {
        SqlValue::Null => Ok(None),
        SqlValue::Timestamp(t) => Ok(Some(*t)),
        SqlValue::Text(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| SqlError::Decode(format!("column '{}': {}", name, e))),
        other => Err(mistyped(name, "timestamp", other)),
    }
}

fn required_timestamp(row: &StoreRow, name: &str) -> Result<DateTime<Utc>> {
    optional_timestamp(row, name)?
        .ok_or_else(|| SqlError::Decode(format!("column '{}' is null", name)))
}

fn count(row: &StoreRow, name: &str) -> Result<u64> {
    let value = cell(row, name)?;
    value
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| mistyped(name, "non-negative integer", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn grouped_row() -> StoreRow {
        let mut row = StoreRow::new();
        row.insert("grouping_value".into(), SqlValue::Text("alice".into()));
        row.insert("total_visits".into(), SqlValue::Int(3));
        row.insert("approved_visits".into(), SqlValue::Int(2));
        row.insert("pending_visits".into(), SqlValue::Int(1));
        row.insert("rejected_visits".into(), SqlValue::Int(0));
        row.insert("flagged_visits".into(), SqlValue::Int(0));
        row.insert(
            "first_visit_date".into(),
            SqlValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap()),
        );
        row.insert("last_visit_date".into(), SqlValue::Text("2024-01-05T09:00:00Z".into()));
        row
    }

    #[test]
    fn test_decode_finishes_ordered_values() {
        let config = ComputationConfig::builder("username")
            .field(FieldComputation::new("first_sick", "sick", AggregationKind::First))
            .field(FieldComputation::new("kinds", "kind", AggregationKind::CountUnique))
            .field(FieldComputation::new("visits", "sick", AggregationKind::Count))
            .field(FieldComputation::new("age", "age", AggregationKind::Avg).default_value(-1i64))
            .build()
            .unwrap();
        let mut row = grouped_row();
        row.insert(
            "first_sick".into(),
            SqlValue::Array(vec![SqlValue::Json(json!("yes")), SqlValue::Json(json!("no"))]),
        );
        row.insert(
            "kinds".into(),
            SqlValue::Array(vec![SqlValue::Json(json!("a")), SqlValue::Json(json!("a"))]),
        );
        row.insert("visits".into(), SqlValue::Int(0));
        row.insert("age".into(), SqlValue::Null);

        let ResultRows::Workers(rows) = decode_rows(&config, &[row]).unwrap() else {
            panic!("expected worker rows");
        };
        let fields = &rows[0].custom_fields;
        assert_eq!(fields["first_sick"], Some(FieldValue::String("yes".into())));
        assert_eq!(fields["kinds"], Some(FieldValue::Integer(1)));
        assert_eq!(fields["visits"], Some(FieldValue::Integer(0)));
        assert_eq!(fields["age"], Some(FieldValue::Integer(-1)));
        assert_eq!(rows[0].approved_visits, 2);
        assert_eq!(
            rows[0].last_visit_date,
            Some(Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_histogram_sparkline() {
        let hist = HistogramComputation::new("h", "v", 0.0, 10.0, 2);
        let config = ComputationConfig::builder("username")
            .histogram(hist)
            .build()
            .unwrap();
        let mut row = grouped_row();
        row.insert("h_0_5".into(), SqlValue::Int(1));
        row.insert("h_5_10".into(), SqlValue::Int(2));
        row.insert("h_mean".into(), SqlValue::Number(5.5));
        row.insert("h_count".into(), SqlValue::Int(3));

        let ResultRows::Workers(rows) = decode_rows(&config, &[row]).unwrap() else {
            panic!("expected worker rows");
        };
        let fields = &rows[0].custom_fields;
        assert_eq!(fields["h_sparkline"], Some(FieldValue::String("▅█".into())));
        assert_eq!(fields["h_mean"], Some(FieldValue::Float(5.5)));
        assert_eq!(fields["h_count"], Some(FieldValue::Integer(3)));
    }

    #[test]
    fn test_missing_column_is_decode_error() {
        let config = ComputationConfig::builder("username")
            .field(FieldComputation::new("x", "x", AggregationKind::Sum))
            .build()
            .unwrap();
        let err = decode_rows(&config, &[grouped_row()]).unwrap_err();
        assert!(matches!(err, SqlError::Decode(_)));
    }

    #[test]
    fn test_mistyped_count_is_decode_error() {
        let config = ComputationConfig::builder("username").build().unwrap();
        let mut row = grouped_row();
        row.insert("total_visits".into(), SqlValue::Text("many".into()));
        assert!(matches!(decode_rows(&config, &[row]), Err(SqlError::Decode(_))));
    }
}
