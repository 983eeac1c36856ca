//! Typed expression tree for pushdown plans
//!
//! Value expressions ([`Expr`]), row predicates ([`Predicate`]) and group
//! reducers ([`AggExpr`]). Nodes carry no SQL text: the renderer decides the
//! spelling and the memory store evaluates them directly.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Columns of the visits table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    DatasetId,
    VisitId,
    /// Position of the visit in its fetched batch
    VisitSeq,
    Username,
    Status,
    Flagged,
    VisitDate,
    EntityId,
    EntityName,
    Latitude,
    Longitude,
    Accuracy,
    /// Payload document (jsonb)
    FormJson,
}

impl Column {
    /// Every column, in table order
    pub const ALL: [Column; 13] = [
        Column::DatasetId,
        Column::VisitId,
        Column::VisitSeq,
        Column::Username,
        Column::Status,
        Column::Flagged,
        Column::VisitDate,
        Column::EntityId,
        Column::EntityName,
        Column::Latitude,
        Column::Longitude,
        Column::Accuracy,
        Column::FormJson,
    ];

    /// Columns returned for every visit-level row
    pub const VISIT_ATTRIBUTES: [Column; 10] = [
        Column::VisitId,
        Column::Username,
        Column::Status,
        Column::VisitDate,
        Column::Flagged,
        Column::EntityId,
        Column::EntityName,
        Column::Latitude,
        Column::Longitude,
        Column::Accuracy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::DatasetId => "dataset_id",
            Column::VisitId => "visit_id",
            Column::VisitSeq => "visit_seq",
            Column::Username => "username",
            Column::Status => "status",
            Column::Flagged => "flagged",
            Column::VisitDate => "visit_date",
            Column::EntityId => "entity_id",
            Column::EntityName => "entity_name",
            Column::Latitude => "latitude",
            Column::Longitude => "longitude",
            Column::Accuracy => "accuracy",
            Column::FormJson => "form_json",
        }
    }

    /// Column addressed by a grouping key naming a base attribute
    pub fn for_attribute(key: &str) -> Option<Column> {
        match key {
            "visit_id" | "id" => Some(Column::VisitId),
            "username" => Some(Column::Username),
            "status" => Some(Column::Status),
            "entity_id" => Some(Column::EntityId),
            "entity_name" => Some(Column::EntityName),
            _ => None,
        }
    }

    pub fn sql_type(&self) -> SqlType {
        match self {
            Column::VisitSeq => SqlType::Integer,
            Column::Flagged => SqlType::Boolean,
            Column::VisitDate => SqlType::Timestamp,
            Column::Latitude | Column::Longitude | Column::Accuracy => SqlType::Number,
            Column::FormJson => SqlType::Json,
            _ => SqlType::Text,
        }
    }
}

/// Static type of an expression, used by the renderer to pick casts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Json,
    Text,
    Number,
    Integer,
    Boolean,
    Timestamp,
}

/// Value expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Base column
    Column(Column),
    /// Key lookups into the payload; a JSON null leaf is absent
    JsonPath(Vec<String>),
    /// First non-absent operand
    Coalesce(Vec<Expr>),
    /// Text form of a value
    Text(Box<Expr>),
    /// Space-trimmed, lower-cased text form
    NormText(Box<Expr>),
    /// Numeric coercion under the shared numeric pattern; absent when not numeric
    Numeric(Box<Expr>),
    /// 1 when the predicate holds, absent otherwise
    Flag(Box<Predicate>),
}

impl Expr {
    /// Lookup of a dot-separated payload path
    pub fn path(path: &str) -> Self {
        Expr::JsonPath(path.split('.').map(str::to_string).collect())
    }

    /// Fallback chain over payload paths
    pub fn paths<S: AsRef<str>>(paths: &[S]) -> Self {
        let mut exprs: Vec<Expr> = paths.iter().map(|p| Expr::path(p.as_ref())).collect();
        if exprs.len() == 1 {
            exprs.remove(0)
        } else {
            Expr::Coalesce(exprs)
        }
    }

    pub fn text(self) -> Self {
        Expr::Text(Box::new(self))
    }

    pub fn norm_text(self) -> Self {
        Expr::NormText(Box::new(self))
    }

    pub fn numeric(self) -> Self {
        Expr::Numeric(Box::new(self))
    }

    pub fn flag(predicate: Predicate) -> Self {
        Expr::Flag(Box::new(predicate))
    }

    pub fn sql_type(&self) -> SqlType {
        match self {
            Expr::Column(c) => c.sql_type(),
            Expr::JsonPath(_) => SqlType::Json,
            Expr::Coalesce(items) => items.first().map_or(SqlType::Json, Expr::sql_type),
            Expr::Text(_) | Expr::NormText(_) => SqlType::Text,
            Expr::Numeric(_) => SqlType::Number,
            Expr::Flag(_) => SqlType::Integer,
        }
    }
}

/// Comparison against a numeric literal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Ge,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
        }
    }

    pub fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Lt => left < right,
            CompareOp::Ge => left >= right,
        }
    }
}

/// Boolean condition; an absent operand makes it false
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Always true
    True,
    /// Conjunction
    And(Vec<Predicate>),
    /// Operand is present
    IsPresent(Expr),
    /// Text column equals a literal
    Equals(Column, String),
    /// Text column is one of the literals
    InList(Column, Vec<String>),
    /// Lower-cased text column equals a lower-case literal
    EqualsIgnoreCase(Column, String),
    /// Boolean column is true
    IsTrue(Column),
    /// Timestamp column is on or after the start of a UTC day
    OnOrAfterDay(Column, NaiveDate),
    /// Timestamp column is before the start of a UTC day
    BeforeDay(Column, NaiveDate),
    /// Normalized text is one of the literals
    TextIn(Expr, Vec<String>),
    /// Text form has a non-whitespace character
    NonBlank(Expr),
    /// Value coerces to a number
    IsNumeric(Expr),
    /// Numeric value compared to a literal
    Compare(Expr, CompareOp, f64),
}

impl Predicate {
    /// Flatten nested conjunctions and drop `True` terms
    pub fn and(terms: Vec<Predicate>) -> Predicate {
        let mut flat = Vec::with_capacity(terms.len());
        for term in terms {
            match term {
                Predicate::True => {}
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::True,
            1 => flat.remove(0),
            _ => Predicate::And(flat),
        }
    }
}

/// Per-group reducer
#[derive(Debug, Clone, PartialEq)]
pub enum AggExpr {
    /// Rows in the group
    CountRows,
    /// Rows satisfying the predicate
    CountWhere(Predicate),
    /// Present values
    Count(Expr),
    Sum(Expr),
    /// Mean rounded to 2 decimals
    RoundedAvg(Expr),
    Min(Expr),
    Max(Expr),
    /// Present values ordered by visit date, then batch position
    OrderedValues(Expr),
}
