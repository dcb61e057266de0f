//! Query intent
//!
//! Structured form of what a question asks for, produced by the resolver and
//! consumed by the planner. Every table and column an intent names has been
//! matched against the catalog it was resolved with.

use crate::catalog::ColumnRef;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Case-insensitive substring match.
    Contains,
}

impl Operator {
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sym = match self {
            Operator::Eq => "=",
            Operator::NotEq => "<>",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Contains => "LIKE",
        };
        f.write_str(sym)
    }
}

/// Literal exactly as understood from the question, before it is checked
/// against a column type.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Literal {
    Integer(i64),
    Decimal(f64),
    Text(String),
    Date(NaiveDate),
    Boolean(bool),
}

impl Literal {
    /// Numbers with no fractional part become integers so "100k" and
    /// "100000.0" produce the same intent.
    pub fn number(value: f64) -> Self {
        if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
            Literal::Integer(value as i64)
        } else {
            Literal::Decimal(value)
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(v) => write!(f, "{}", v),
            Literal::Decimal(v) => write!(f, "{}", v),
            Literal::Text(v) => write!(f, "{}", v),
            Literal::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Literal::Boolean(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: ColumnRef,
    pub operator: Operator,
    pub value: Literal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggregateKind {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateKind::Count => "COUNT",
            AggregateKind::Sum => "SUM",
            AggregateKind::Avg => "AVG",
            AggregateKind::Max => "MAX",
            AggregateKind::Min => "MIN",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AggregateKind::Count => "count",
            AggregateKind::Sum => "sum",
            AggregateKind::Avg => "avg",
            AggregateKind::Max => "max",
            AggregateKind::Min => "min",
        }
    }
}

/// What is aggregated. `Rows` is `COUNT(*)`-style counting of a table's rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum AggregateTarget {
    Rows { table: String },
    Column { column: ColumnRef },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub kind: AggregateKind,
    pub target: AggregateTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryIntent {
    /// Table the question is about; the FROM table for plain selections.
    pub base_table: String,
    /// Every table the intent touches, base included, sorted.
    pub tables: Vec<String>,
    /// Explicitly requested columns. Empty means every column of the base table.
    pub projection: Vec<ColumnRef>,
    /// Conjunctive filters, kept in canonical order.
    pub predicates: Vec<Predicate>,
    pub aggregations: Vec<Aggregation>,
    pub group_by: Vec<ColumnRef>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    /// Set when the question asks to change data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_request: Option<String>,
}

impl QueryIntent {
    pub fn new(base_table: impl Into<String>) -> Self {
        let base_table = base_table.into();
        Self {
            tables: vec![base_table.clone()],
            base_table,
            projection: Vec::new(),
            predicates: Vec::new(),
            aggregations: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            write_request: None,
        }
    }

    /// Put the intent in canonical form: sorted, de-duplicated tables and
    /// predicates, de-duplicated group columns.
    pub fn normalize(&mut self) {
        let mut tables: Vec<String> = std::iter::once(self.base_table.clone())
            .chain(self.projection.iter().map(|c| c.table.clone()))
            .chain(self.predicates.iter().map(|p| p.column.table.clone()))
            .chain(self.group_by.iter().map(|c| c.table.clone()))
            .chain(self.order_by.iter().map(|o| o.column.table.clone()))
            .chain(self.aggregations.iter().map(|a| match &a.target {
                AggregateTarget::Rows { table } => table.clone(),
                AggregateTarget::Column { column } => column.table.clone(),
            }))
            .chain(self.tables.iter().cloned())
            .collect();
        tables.sort();
        tables.dedup();
        self.tables = tables;

        self.predicates.sort_by(|a, b| {
            (&a.column, a.operator)
                .cmp(&(&b.column, b.operator))
                .then_with(|| {
                    a.value
                        .partial_cmp(&b.value)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        self.predicates.dedup();

        let mut seen = Vec::new();
        self.group_by.retain(|c| {
            if seen.contains(c) {
                false
            } else {
                seen.push(c.clone());
                true
            }
        });
    }

    /// Cache key: two questions resolving to the same intent share results.
    pub fn signature(&self) -> String {
        let mut canonical = self.clone();
        canonical.normalize();
        // Serializing plain data structures cannot fail.
        serde_json::to_string(&canonical).unwrap_or_else(|_| format!("{:?}", canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicate(column: &str, op: Operator, value: Literal) -> Predicate {
        Predicate {
            column: ColumnRef::new("employees", column),
            operator: op,
            value,
        }
    }

    #[test]
    fn test_literal_number_normalization() {
        assert_eq!(Literal::number(100000.0), Literal::Integer(100000));
        assert_eq!(Literal::number(2.5), Literal::Decimal(2.5));
    }

    #[test]
    fn test_signature_ignores_predicate_order() {
        let mut a = QueryIntent::new("employees");
        a.predicates.push(predicate("annual_salary", Operator::Gt, Literal::Integer(100000)));
        a.predicates.push(predicate("position", Operator::Eq, Literal::Text("Engineer".into())));

        let mut b = QueryIntent::new("employees");
        b.predicates.push(predicate("position", Operator::Eq, Literal::Text("Engineer".into())));
        b.predicates.push(predicate("annual_salary", Operator::Gt, Literal::Integer(100000)));

        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_signature_distinguishes_values() {
        let mut a = QueryIntent::new("employees");
        a.predicates.push(predicate("annual_salary", Operator::Gt, Literal::Integer(100000)));
        let mut b = QueryIntent::new("employees");
        b.predicates.push(predicate("annual_salary", Operator::Gt, Literal::Integer(90000)));
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_normalize_collects_tables() {
        let mut intent = QueryIntent::new("employees");
        intent.predicates.push(Predicate {
            column: ColumnRef::new("departments", "dept_name"),
            operator: Operator::Eq,
            value: Literal::Text("Engineering".into()),
        });
        intent.normalize();
        assert_eq!(intent.tables, vec!["departments", "employees"]);
    }
}
