//! Config to query plan translation
//!
//! A [`ComputationConfig`] compiles to one [`QueryPlan`]: row predicates
//! from the dataset and the filters, then either one output column per field
//! (visit level) or the standard worker columns plus one reducer per field and
//! per histogram bin (aggregated). The plan is rendered once to SQL and kept
//! alongside the text in a [`CompiledQuery`].

use crate::error::{Result, SqlError};
use crate::expr::{AggExpr, Column, Expr, Predicate};
use crate::functions::FunctionRegistry;
use crate::parser::SqlParser;
use crate::render::PostgresRenderer;
use tracing::debug;
use visitlens_query::{
    ComputationConfig, FieldComputation, HistogramComputation, StatusClass, TerminalStage,
    VisitFilters,
};

/// Output column names of the standard worker fields
pub mod columns {
    pub const GROUPING_VALUE: &str = "grouping_value";
    pub const TOTAL_VISITS: &str = "total_visits";
    pub const APPROVED_VISITS: &str = "approved_visits";
    pub const PENDING_VISITS: &str = "pending_visits";
    pub const REJECTED_VISITS: &str = "rejected_visits";
    pub const FLAGGED_VISITS: &str = "flagged_visits";
    pub const FIRST_VISIT_DATE: &str = "first_visit_date";
    pub const LAST_VISIT_DATE: &str = "last_visit_date";
}

/// Named output column of a grouped plan
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub alias: String,
    pub agg: AggExpr,
}

impl OutputColumn {
    pub fn new(alias: impl Into<String>, agg: AggExpr) -> Self {
        Self {
            alias: alias.into(),
            agg,
        }
    }
}

/// Row layout of a plan
#[derive(Debug, Clone, PartialEq)]
pub enum PlanShape {
    /// One row per visit: base attributes plus one value per field
    Visits { fields: Vec<(String, Expr)> },
    /// One row per grouping value
    Groups { key: Expr, columns: Vec<OutputColumn> },
}

/// Backend-neutral query plan
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub table: String,
    pub dataset_id: String,
    /// Row predicate, dataset scoping excluded
    pub filter: Predicate,
    pub shape: PlanShape,
}

/// Plan plus its rendered SQL
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub plan: QueryPlan,
    pub sql: String,
}

/// Compiles computation configs into plans
#[derive(Debug, Clone)]
pub struct SqlTranslator {
    table: String,
    verify: bool,
}

impl SqlTranslator {
    /// Create a translator targeting `table`
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            verify: false,
        }
    }

    /// Parse every rendered statement before returning it
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Compile a config for one dataset
    pub fn translate(&self, config: &ComputationConfig, dataset_id: &str) -> Result<CompiledQuery> {
        config.validate()?;
        if dataset_id.is_empty() {
            return Err(SqlError::Translation("dataset id must not be empty".to_string()));
        }

        let plan = self.plan(config, dataset_id);
        let sql = PostgresRenderer::render(&plan)?;
        if self.verify {
            SqlParser::parse_select(&sql)?;
        }
        debug!(dataset = dataset_id, stage = %config.terminal_stage, sql = %sql, "compiled pushdown query");
        Ok(CompiledQuery { plan, sql })
    }

    /// Build the plan without rendering it
    pub fn plan(&self, config: &ComputationConfig, dataset_id: &str) -> QueryPlan {
        let filter = filter_predicate(&config.filters);
        let shape = match config.terminal_stage {
            TerminalStage::VisitLevel => PlanShape::Visits {
                fields: config
                    .fields
                    .iter()
                    .map(|f| (f.name.clone(), field_value(f)))
                    .collect(),
            },
            TerminalStage::Aggregated => PlanShape::Groups {
                key: grouping_expr(&config.grouping_key),
                columns: group_columns(config),
            },
        };

        QueryPlan {
            table: self.table.clone(),
            dataset_id: dataset_id.to_string(),
            filter,
            shape,
        }
    }
}

/// Grouping key: a base column, or the text of a payload path
pub fn grouping_expr(key: &str) -> Expr {
    match Column::for_attribute(key) {
        Some(column) => Expr::Column(column),
        None => Expr::path(key).text(),
    }
}

/// Per-visit value of a field: extraction, then the optional transform
pub fn field_value(field: &FieldComputation) -> Expr {
    let raw = Expr::paths(&field.paths);
    match field.transform {
        Some(t) => FunctionRegistry::transform(t, raw),
        None => raw,
    }
}

/// Per-visit numeric value of a histogram
pub fn histogram_value(histogram: &HistogramComputation) -> Expr {
    let raw = Expr::paths(&histogram.paths);
    let value = match histogram.transform {
        Some(t) => FunctionRegistry::transform(t, raw),
        None => raw,
    };
    value.numeric()
}

fn filter_predicate(filters: &VisitFilters) -> Predicate {
    let mut terms = Vec::new();
    if !filters.statuses.is_empty() {
        terms.push(Predicate::InList(
            Column::Status,
            filters.statuses.iter().cloned().collect(),
        ));
    }
    if filters.flagged_only {
        terms.push(Predicate::IsTrue(Column::Flagged));
    }
    if let Some(from) = filters.date_from {
        terms.push(Predicate::OnOrAfterDay(Column::VisitDate, from));
    }
    if let Some(to) = filters.date_to {
        // Inclusive last day: strictly before the following midnight
        if let Some(next) = to.succ_opt() {
            terms.push(Predicate::BeforeDay(Column::VisitDate, next));
        }
    }
    if !filters.usernames.is_empty() {
        terms.push(Predicate::InList(
            Column::Username,
            filters.usernames.iter().cloned().collect(),
        ));
    }
    Predicate::and(terms)
}

fn group_columns(config: &ComputationConfig) -> Vec<OutputColumn> {
    let status_count = |alias: &str, class: StatusClass| {
        OutputColumn::new(
            alias,
            AggExpr::CountWhere(Predicate::EqualsIgnoreCase(
                Column::Status,
                class.label().to_string(),
            )),
        )
    };

    let mut out = vec![
        OutputColumn::new(columns::TOTAL_VISITS, AggExpr::CountRows),
        status_count(columns::APPROVED_VISITS, StatusClass::Approved),
        status_count(columns::PENDING_VISITS, StatusClass::Pending),
        status_count(columns::REJECTED_VISITS, StatusClass::Rejected),
        OutputColumn::new(
            columns::FLAGGED_VISITS,
            AggExpr::CountWhere(Predicate::IsTrue(Column::Flagged)),
        ),
        OutputColumn::new(columns::FIRST_VISIT_DATE, AggExpr::Min(Expr::Column(Column::VisitDate))),
        OutputColumn::new(columns::LAST_VISIT_DATE, AggExpr::Max(Expr::Column(Column::VisitDate))),
    ];

    for field in &config.fields {
        out.push(OutputColumn::new(
            field.name.clone(),
            FunctionRegistry::aggregate(field.aggregation, field_value(field)),
        ));
    }

    for histogram in &config.histograms {
        out.extend(histogram_columns(histogram));
    }
    out
}

/// Bin counts restricted by range predicates, then mean and count.
///
/// With out-of-range inclusion on, the first bin loses its lower bound and
/// the last bin its upper bound.
fn histogram_columns(histogram: &HistogramComputation) -> Vec<OutputColumn> {
    use crate::expr::CompareOp::{Ge, Lt};

    let value = histogram_value(histogram);
    let edges = histogram.edges();
    let n = histogram.num_bins as usize;
    let widen = histogram.include_out_of_range;

    let mut out: Vec<OutputColumn> = histogram
        .bin_names()
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let mut terms = vec![Predicate::IsPresent(value.clone())];
            if !(widen && i == 0) {
                terms.push(Predicate::Compare(value.clone(), Ge, edges[i]));
            }
            if !(widen && i == n - 1) {
                terms.push(Predicate::Compare(value.clone(), Lt, edges[i + 1]));
            }
            OutputColumn::new(name, AggExpr::CountWhere(Predicate::and(terms)))
        })
        .collect();

    out.push(OutputColumn::new(histogram.mean_name(), AggExpr::RoundedAvg(value.clone())));
    out.push(OutputColumn::new(histogram.count_name(), AggExpr::Count(value)));
    out
}
