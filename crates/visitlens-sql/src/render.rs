//! PostgreSQL rendering
//!
//! Turns a [`QueryPlan`] into one SELECT statement. Identifiers are always
//! double-quoted and literals single-quoted with quotes doubled; nothing from
//! a config reaches the statement unescaped.

use crate::error::{Result, SqlError};
use crate::expr::{AggExpr, Column, Expr, Predicate, SqlType};
use crate::translator::{columns, PlanShape, QueryPlan};
use chrono::NaiveDate;
use visitlens_core::{NON_BLANK_PATTERN, NUMERIC_PATTERN};

/// Numeric expressions are double precision so reducers see the same
/// binary values as in-process aggregation
const FLOAT: &str = "DOUBLE PRECISION";

/// Renders plans as PostgreSQL
pub struct PostgresRenderer;

impl PostgresRenderer {
    /// Render a full statement
    pub fn render(plan: &QueryPlan) -> Result<String> {
        let table = table_name(&plan.table)?;
        let dataset = Predicate::Equals(Column::DatasetId, plan.dataset_id.clone());

        match &plan.shape {
            PlanShape::Visits { fields } => {
                let mut select: Vec<String> = Column::VISIT_ATTRIBUTES
                    .iter()
                    .map(|c| ident(c.name()))
                    .collect::<Result<_>>()?;
                for (name, expr) in fields {
                    select.push(format!("{} AS {}", Self::expr(expr)?, ident(name)?));
                }
                let filter = Predicate::and(vec![dataset, plan.filter.clone()]);
                Ok(format!(
                    "SELECT {}\nFROM {}\nWHERE {}\nORDER BY {} ASC, {} ASC",
                    select.join(", "),
                    table,
                    Self::predicate(&filter)?,
                    ident(Column::VisitDate.name())?,
                    ident(Column::VisitSeq.name())?,
                ))
            }
            PlanShape::Groups { key, columns: outputs } => {
                let mut select = vec![format!(
                    "{} AS {}",
                    Self::expr(key)?,
                    ident(columns::GROUPING_VALUE)?
                )];
                for column in outputs {
                    select.push(format!("{} AS {}", Self::agg(&column.agg)?, ident(&column.alias)?));
                }
                let filter = Predicate::and(vec![
                    dataset,
                    plan.filter.clone(),
                    Predicate::IsPresent(key.clone()),
                ]);
                Ok(format!(
                    "SELECT {}\nFROM {}\nWHERE {}\nGROUP BY 1\nORDER BY 1",
                    select.join(", "),
                    table,
                    Self::predicate(&filter)?,
                ))
            }
        }
    }

    /// Render a value expression
    pub fn expr(expr: &Expr) -> Result<String> {
        Ok(match expr {
            Expr::Column(c) => ident(c.name())?,
            Expr::JsonPath(segments) => {
                let mut out = ident(Column::FormJson.name())?;
                for segment in segments {
                    out.push_str(" -> ");
                    out.push_str(&literal(segment)?);
                }
                format!("NULLIF({}, CAST('null' AS JSONB))", out)
            }
            Expr::Coalesce(items) => {
                let rendered = items.iter().map(Self::expr).collect::<Result<Vec<_>>>()?;
                match rendered.len() {
                    1 => rendered.into_iter().collect(),
                    _ => format!("COALESCE({})", rendered.join(", ")),
                }
            }
            Expr::Text(inner) => Self::text(inner)?,
            Expr::NormText(inner) => format!("lower(trim({}))", Self::text(inner)?),
            Expr::Numeric(inner) => match inner.sql_type() {
                SqlType::Number => Self::expr(inner)?,
                SqlType::Integer => format!("CAST({} AS {})", Self::expr(inner)?, FLOAT),
                SqlType::Json | SqlType::Text => {
                    let text = Self::text(inner)?;
                    format!(
                        "CASE WHEN {} ~ {} THEN CAST({} AS {}) END",
                        text,
                        literal(NUMERIC_PATTERN)?,
                        text,
                        FLOAT
                    )
                }
                SqlType::Boolean | SqlType::Timestamp => format!("CAST(NULL AS {})", FLOAT),
            },
            Expr::Flag(pred) => format!("CASE WHEN {} THEN 1 END", Self::predicate(pred)?),
        })
    }

    /// Render a predicate
    pub fn predicate(pred: &Predicate) -> Result<String> {
        Ok(match pred {
            Predicate::True => "TRUE".to_string(),
            Predicate::And(terms) => {
                let rendered = terms.iter().map(Self::predicate).collect::<Result<Vec<_>>>()?;
                format!("({})", rendered.join(" AND "))
            }
            Predicate::IsPresent(expr) => format!("{} IS NOT NULL", Self::expr(expr)?),
            Predicate::Equals(column, value) => {
                format!("{} = {}", ident(column.name())?, literal(value)?)
            }
            Predicate::InList(column, values) => {
                format!("{} IN ({})", ident(column.name())?, literal_list(values)?)
            }
            Predicate::EqualsIgnoreCase(column, value) => format!(
                "lower({}) = {}",
                ident(column.name())?,
                literal(&value.to_lowercase())?
            ),
            Predicate::IsTrue(column) => format!("{} IS TRUE", ident(column.name())?),
            Predicate::OnOrAfterDay(column, day) => {
                format!("{} >= {}", ident(column.name())?, day_start(*day))
            }
            Predicate::BeforeDay(column, day) => {
                format!("{} < {}", ident(column.name())?, day_start(*day))
            }
            Predicate::TextIn(expr, values) => {
                format!("{} IN ({})", Self::expr(expr)?, literal_list(values)?)
            }
            Predicate::NonBlank(expr) => {
                format!("{} ~ {}", Self::text(expr)?, literal(NON_BLANK_PATTERN)?)
            }
            Predicate::IsNumeric(expr) => match expr.sql_type() {
                SqlType::Json | SqlType::Text => {
                    format!("{} ~ {}", Self::text(expr)?, literal(NUMERIC_PATTERN)?)
                }
                SqlType::Number | SqlType::Integer => format!("{} IS NOT NULL", Self::expr(expr)?),
                SqlType::Boolean | SqlType::Timestamp => "FALSE".to_string(),
            },
            Predicate::Compare(expr, op, value) => {
                format!("{} {} {}", Self::expr(expr)?, op.symbol(), number(*value))
            }
        })
    }

    /// Render a reducer
    pub fn agg(agg: &AggExpr) -> Result<String> {
        Ok(match agg {
            AggExpr::CountRows => "count(*)".to_string(),
            AggExpr::CountWhere(pred) => {
                format!("count(*) FILTER (WHERE {})", Self::predicate(pred)?)
            }
            AggExpr::Count(expr) => format!("count({})", Self::expr(expr)?),
            AggExpr::Sum(expr) => format!("sum({})", Self::expr(expr)?),
            // float8 to numeric keeps 15 significant digits, the digits `round2` rounds
            AggExpr::RoundedAvg(expr) => {
                format!("round(CAST(avg({}) AS NUMERIC), 2)", Self::expr(expr)?)
            }
            AggExpr::Min(expr) => format!("min({})", Self::expr(expr)?),
            AggExpr::Max(expr) => format!("max({})", Self::expr(expr)?),
            AggExpr::OrderedValues(expr) => {
                let value = Self::expr(expr)?;
                format!(
                    "array_agg({} ORDER BY {} ASC, {} ASC) FILTER (WHERE {} IS NOT NULL)",
                    value,
                    ident(Column::VisitDate.name())?,
                    ident(Column::VisitSeq.name())?,
                    value
                )
            }
        })
    }

    /// Text form of an expression, by its type.
    ///
    /// JSON numbers print as plain decimals without trailing zeros, the way
    /// `FieldValue::to_text` prints them; other JSON scalars print unquoted.
    fn text(expr: &Expr) -> Result<String> {
        Ok(match expr.sql_type() {
            SqlType::Json => {
                let json = Self::expr(expr)?;
                format!(
                    "CASE WHEN jsonb_typeof({json}) = 'number' \
THEN CAST(trim_scale(CAST({json} AS NUMERIC)) AS TEXT) ELSE ({json} #>> '{{}}') END",
                    json = json
                )
            }
            SqlType::Text => Self::expr(expr)?,
            SqlType::Number | SqlType::Integer | SqlType::Boolean | SqlType::Timestamp => {
                format!("CAST({} AS TEXT)", Self::expr(expr)?)
            }
        })
    }
}

/// Double-quoted identifier
pub fn ident(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(SqlError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Single-quoted string literal
pub fn literal(value: &str) -> Result<String> {
    if value.contains('\0') {
        return Err(SqlError::Translation(format!(
            "literal contains a NUL byte: {:?}",
            value
        )));
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

fn literal_list(values: &[String]) -> Result<String> {
    let rendered = values.iter().map(|v| literal(v)).collect::<Result<Vec<_>>>()?;
    Ok(rendered.join(", "))
}

fn table_name(table: &str) -> Result<String> {
    let parts = table.split('.').map(ident).collect::<Result<Vec<_>>>()?;
    Ok(parts.join("."))
}

fn day_start(day: NaiveDate) -> String {
    format!(
        "CAST('{}T00:00:00Z' AS TIMESTAMP WITH TIME ZONE)",
        day.format("%Y-%m-%d")
    )
}

fn number(value: f64) -> String {
    format!("{}", value)
}
