//! Query Planner - deterministic SQL generation from a resolved intent
//!
//! Builds a small relational plan (projection, joins, selection, grouping,
//! ordering, limit) against the catalog and renders it for the connected
//! dialect. Literal values never appear in the SQL text: every one of them
//! is checked against its column type and bound as a parameter.

pub mod guard;
pub mod render;

pub use render::Dialect;

use crate::catalog::{CanonicalType, ColumnModel, ColumnRef, JoinStep, SchemaCatalog};
use crate::error::{EngineError, Result};
use crate::intent::{
    AggregateKind, AggregateTarget, Direction, Literal, Operator, OrderBy, QueryIntent,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlParam {
    Integer(i64),
    Decimal(f64),
    Text(String),
    Date(NaiveDate),
    Boolean(bool),
}

/// Rendered, parameterized statement ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlPlan {
    pub sql: String,
    pub params: Vec<SqlParam>,
    pub dialect: Dialect,
    /// Labels of the result columns, in select order.
    pub output_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateArg {
    Star,
    Column(ColumnRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Column { column: ColumnRef, alias: String },
    Aggregate { kind: AggregateKind, arg: AggregateArg, alias: String },
}

impl SelectItem {
    pub fn alias(&self) -> &str {
        match self {
            SelectItem::Column { alias, .. } | SelectItem::Aggregate { alias, .. } => alias,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundPredicate {
    pub column: ColumnRef,
    pub operator: Operator,
    pub param: SqlParam,
}

/// Relational plan prior to rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalPlan {
    pub from: String,
    pub joins: Vec<(JoinStep, JoinKind)>,
    pub projection: Vec<SelectItem>,
    pub selection: Vec<BoundPredicate>,
    pub group_by: Vec<ColumnRef>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
}

pub struct QueryPlanner {
    dialect: Dialect,
    default_row_limit: u64,
}

impl QueryPlanner {
    pub fn new(dialect: Dialect, default_row_limit: u64) -> Self {
        Self {
            dialect,
            default_row_limit,
        }
    }

    /// Validate, plan and render an intent.
    pub fn plan(&self, intent: &QueryIntent, catalog: &SchemaCatalog) -> Result<SqlPlan> {
        let logical = self.logical_plan(intent, catalog)?;
        let plan = render::render(&logical, self.dialect);
        guard::check_read_only(&plan.sql, self.dialect)?;
        debug!("Planned SQL: {} ({} params)", plan.sql, plan.params.len());
        Ok(plan)
    }

    pub fn logical_plan(&self, intent: &QueryIntent, catalog: &SchemaCatalog) -> Result<LogicalPlan> {
        if let Some(word) = &intent.write_request {
            return Err(EngineError::UnsupportedIntent(format!(
                "'{}' asks to change data; only read-only questions are supported",
                word
            )));
        }

        let mut intent = intent.clone();
        intent.normalize();
        validate_references(&intent, catalog)?;
        validate_aggregations(&intent, catalog)?;

        // Grouped row counts over another table start from the grouping
        // table so that groups without rows still report zero.
        let counted_table = intent.aggregations.iter().find_map(|a| match &a.target {
            AggregateTarget::Rows { table } => Some(table.clone()),
            AggregateTarget::Column { .. } => None,
        });
        let group_table = single_table(&intent.group_by);
        let left_join_from = match (&counted_table, &group_table) {
            (Some(counted), Some(group)) if !counted.eq_ignore_ascii_case(group) => {
                Some(group.clone())
            }
            _ => None,
        };

        let (from, join_kind) = match &left_join_from {
            Some(group) => (canonical_table(catalog, group), JoinKind::Left),
            None => (canonical_table(catalog, &intent.base_table), JoinKind::Inner),
        };
        let targets: Vec<String> = intent
            .tables
            .iter()
            .filter(|t| !t.eq_ignore_ascii_case(&from))
            .cloned()
            .collect();
        let joins = catalog
            .join_chain(&from, &targets)?
            .into_iter()
            .map(|step| (step, join_kind))
            .collect();

        let projection = self.projection(&intent, catalog, left_join_from.is_some())?;

        let selection = intent
            .predicates
            .iter()
            .map(|p| {
                let column = catalog
                    .column(&p.column)
                    .ok_or_else(|| EngineError::UnresolvedReference(p.column.to_string()))?;
                let param = bind_literal(&p.column, column, p.operator, &p.value)?;
                Ok(BoundPredicate {
                    column: p.column.clone(),
                    operator: p.operator,
                    param,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let order_by = self.order_by(&intent, catalog, &from);
        let limit = match intent.limit {
            Some(limit) => Some(limit),
            None if intent.aggregations.is_empty() => Some(self.default_row_limit),
            None => None,
        };

        Ok(LogicalPlan {
            from,
            joins,
            projection,
            selection,
            group_by: intent.group_by.clone(),
            order_by,
            limit,
        })
    }

    fn projection(
        &self,
        intent: &QueryIntent,
        catalog: &SchemaCatalog,
        count_keys: bool,
    ) -> Result<Vec<SelectItem>> {
        let mut items = Vec::new();

        if intent.aggregations.is_empty() {
            let columns: Vec<ColumnRef> = if intent.projection.is_empty() {
                let base = catalog
                    .table(&intent.base_table)
                    .ok_or_else(|| EngineError::UnresolvedReference(intent.base_table.clone()))?;
                base.columns
                    .iter()
                    .map(|c| ColumnRef::new(base.name.clone(), c.name.clone()))
                    .collect()
            } else {
                intent.projection.clone()
            };
            for column in columns {
                let alias = unique_alias(&items, &column.column, &column);
                items.push(SelectItem::Column { column, alias });
            }
            return Ok(items);
        }

        for column in &intent.group_by {
            let alias = unique_alias(&items, &column.column, column);
            items.push(SelectItem::Column {
                column: column.clone(),
                alias,
            });
        }

        for aggregation in &intent.aggregations {
            let (arg, base_label) = match &aggregation.target {
                AggregateTarget::Rows { table } if count_keys => {
                    let model = catalog
                        .table(table)
                        .ok_or_else(|| EngineError::UnresolvedReference(table.clone()))?;
                    let key = model
                        .primary_key_column()
                        .or_else(|| model.columns.first())
                        .ok_or_else(|| {
                            EngineError::UnsupportedIntent(format!("table '{}' has no columns", table))
                        })?;
                    (
                        AggregateArg::Column(ColumnRef::new(model.name.clone(), key.name.clone())),
                        aggregation.kind.label().to_string(),
                    )
                }
                AggregateTarget::Rows { .. } => {
                    (AggregateArg::Star, aggregation.kind.label().to_string())
                }
                AggregateTarget::Column { column } => (
                    AggregateArg::Column(column.clone()),
                    format!("{}_{}", aggregation.kind.label(), column.column),
                ),
            };
            let mut alias = base_label.clone();
            let mut n = 2;
            while items.iter().any(|i| i.alias() == alias) {
                alias = format!("{}_{}", base_label, n);
                n += 1;
            }
            items.push(SelectItem::Aggregate {
                kind: aggregation.kind,
                arg,
                alias,
            });
        }

        Ok(items)
    }

    fn order_by(&self, intent: &QueryIntent, catalog: &SchemaCatalog, from: &str) -> Vec<OrderBy> {
        let mut order = intent.order_by.clone();

        if !intent.aggregations.is_empty() {
            if order.is_empty() {
                order = intent
                    .group_by
                    .iter()
                    .map(|c| OrderBy {
                        column: c.clone(),
                        direction: Direction::Asc,
                    })
                    .collect();
            }
            return order;
        }

        // Primary key as the final tie-break keeps plain results stable.
        if let Some(table) = catalog.table(from) {
            if let Some(pk) = &table.primary_key {
                let key = ColumnRef::new(table.name.clone(), pk.clone());
                if !order.iter().any(|o| o.column == key) {
                    order.push(OrderBy {
                        column: key,
                        direction: Direction::Asc,
                    });
                }
            }
        }
        order
    }
}

fn canonical_table(catalog: &SchemaCatalog, name: &str) -> String {
    catalog
        .table(name)
        .map(|t| t.name.clone())
        .unwrap_or_else(|| name.to_string())
}

fn single_table(columns: &[ColumnRef]) -> Option<String> {
    let first = columns.first()?;
    columns
        .iter()
        .all(|c| c.table.eq_ignore_ascii_case(&first.table))
        .then(|| first.table.clone())
}

fn unique_alias(items: &[SelectItem], preferred: &str, column: &ColumnRef) -> String {
    if items.iter().any(|i| i.alias() == preferred) {
        format!("{}.{}", column.table, column.column)
    } else {
        preferred.to_string()
    }
}

fn validate_references(intent: &QueryIntent, catalog: &SchemaCatalog) -> Result<()> {
    for table in &intent.tables {
        if catalog.table(table).is_none() {
            return Err(EngineError::UnresolvedReference(table.clone()));
        }
    }

    let columns = intent
        .projection
        .iter()
        .chain(intent.predicates.iter().map(|p| &p.column))
        .chain(intent.group_by.iter())
        .chain(intent.order_by.iter().map(|o| &o.column))
        .chain(intent.aggregations.iter().filter_map(|a| match &a.target {
            AggregateTarget::Column { column } => Some(column),
            AggregateTarget::Rows { .. } => None,
        }));
    for column in columns {
        if catalog.column(column).is_none() {
            return Err(EngineError::UnresolvedReference(column.to_string()));
        }
    }
    Ok(())
}

fn validate_aggregations(intent: &QueryIntent, catalog: &SchemaCatalog) -> Result<()> {
    if intent.aggregations.is_empty() {
        if !intent.group_by.is_empty() {
            return Err(EngineError::UnsupportedIntent(
                "grouping requires an aggregate such as a count or an average".to_string(),
            ));
        }
        return Ok(());
    }

    for aggregation in &intent.aggregations {
        let AggregateTarget::Column { column } = &aggregation.target else {
            continue;
        };
        let Some(model) = catalog.column(column) else {
            continue;
        };
        let supported = match aggregation.kind {
            AggregateKind::Count => true,
            AggregateKind::Sum | AggregateKind::Avg => model.canonical_type.is_numeric(),
            AggregateKind::Max | AggregateKind::Min => {
                model.canonical_type.is_ordered() || model.canonical_type == CanonicalType::Text
            }
        };
        if !supported {
            return Err(EngineError::UnsupportedIntent(format!(
                "cannot compute {} of {} column {}",
                aggregation.kind.sql_name(),
                model.canonical_type,
                column
            )));
        }
    }

    for column in intent.projection.iter().chain(intent.order_by.iter().map(|o| &o.column)) {
        if !intent.group_by.contains(column) {
            return Err(EngineError::UnsupportedIntent(format!(
                "column {} is neither grouped nor aggregated",
                column
            )));
        }
    }
    Ok(())
}

/// Check a literal against the column's canonical type and produce the
/// value that will be bound.
fn bind_literal(
    column_ref: &ColumnRef,
    column: &ColumnModel,
    operator: Operator,
    literal: &Literal,
) -> Result<SqlParam> {
    let ty = column.canonical_type;
    let mismatch = || EngineError::TypeMismatch {
        column: column_ref.to_string(),
        expected: ty,
        literal: literal.to_string(),
    };

    if operator == Operator::Contains {
        return match ty {
            CanonicalType::Text | CanonicalType::Other => Ok(SqlParam::Text(format!(
                "%{}%",
                literal.to_string().to_lowercase()
            ))),
            _ => Err(mismatch()),
        };
    }
    if operator.is_ordering() && ty == CanonicalType::Boolean {
        return Err(mismatch());
    }

    match (ty, literal) {
        (CanonicalType::Integer, Literal::Integer(v)) => Ok(SqlParam::Integer(*v)),
        (CanonicalType::Integer, Literal::Decimal(v)) if v.fract() == 0.0 => {
            Ok(SqlParam::Integer(*v as i64))
        }
        (CanonicalType::Decimal, Literal::Integer(v)) => Ok(SqlParam::Decimal(*v as f64)),
        (CanonicalType::Decimal, Literal::Decimal(v)) => Ok(SqlParam::Decimal(*v)),
        (CanonicalType::Date, Literal::Date(d)) => Ok(SqlParam::Date(*d)),
        (CanonicalType::Date, Literal::Text(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(SqlParam::Date)
            .map_err(|_| mismatch()),
        (CanonicalType::Text, Literal::Text(s)) | (CanonicalType::Other, Literal::Text(s)) => {
            Ok(SqlParam::Text(s.clone()))
        }
        (CanonicalType::Boolean, Literal::Boolean(b)) => Ok(SqlParam::Boolean(*b)),
        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::builder::tests::employee_schema;
    use crate::catalog::CatalogBuilder;
    use crate::intent::{Aggregation, Predicate};

    fn catalog() -> SchemaCatalog {
        CatalogBuilder::from_raw(employee_schema(), 1)
    }

    fn engineering_over_100k() -> QueryIntent {
        let mut intent = QueryIntent::new("employees");
        intent.predicates.push(Predicate {
            column: ColumnRef::new("departments", "dept_name"),
            operator: Operator::Eq,
            value: Literal::Text("Engineering".to_string()),
        });
        intent.predicates.push(Predicate {
            column: ColumnRef::new("employees", "annual_salary"),
            operator: Operator::Gt,
            value: Literal::Integer(100000),
        });
        intent
    }

    #[test]
    fn test_plan_filters_are_parameterized() {
        let planner = QueryPlanner::new(Dialect::Postgres, 1000);
        let plan = planner.plan(&engineering_over_100k(), &catalog()).unwrap();

        assert!(plan.sql.contains("INNER JOIN \"departments\""));
        assert!(plan.sql.contains("\"departments\".\"dept_name\" = $1"));
        assert!(plan.sql.contains("\"employees\".\"annual_salary\" > $2"));
        assert!(plan.sql.ends_with("LIMIT $3"));
        assert!(!plan.sql.contains("Engineering"));
        assert!(!plan.sql.contains("100000"));
        assert_eq!(
            plan.params,
            vec![
                SqlParam::Text("Engineering".to_string()),
                SqlParam::Decimal(100000.0),
                SqlParam::Integer(1000),
            ]
        );
        assert_eq!(plan.output_columns[0], "emp_id");
        assert_eq!(plan.output_columns.len(), 6);
    }

    #[test]
    fn test_sqlite_placeholders() {
        let planner = QueryPlanner::new(Dialect::Sqlite, 50);
        let plan = planner.plan(&engineering_over_100k(), &catalog()).unwrap();
        assert!(plan.sql.contains("= ?1"));
        assert!(plan.sql.contains("> ?2"));
        assert!(plan.sql.ends_with("LIMIT ?3"));
    }

    #[test]
    fn test_grouped_count_starts_from_group_table() {
        let mut intent = QueryIntent::new("employees");
        intent.aggregations.push(Aggregation {
            kind: AggregateKind::Count,
            target: AggregateTarget::Rows {
                table: "employees".to_string(),
            },
        });
        intent.group_by.push(ColumnRef::new("departments", "dept_name"));

        let planner = QueryPlanner::new(Dialect::Sqlite, 1000);
        let plan = planner.plan(&intent, &catalog()).unwrap();
        assert_eq!(
            plan.sql,
            "SELECT \"departments\".\"dept_name\" AS \"dept_name\", COUNT(\"employees\".\"emp_id\") AS \"count\" \
             FROM \"departments\" LEFT JOIN \"employees\" ON \"departments\".\"dept_id\" = \"employees\".\"dept_id\" \
             GROUP BY \"departments\".\"dept_name\" ORDER BY \"departments\".\"dept_name\" ASC"
        );
        assert!(plan.params.is_empty());
        assert_eq!(plan.output_columns, vec!["dept_name", "count"]);
    }

    #[test]
    fn test_type_mismatch() {
        let mut intent = QueryIntent::new("employees");
        intent.predicates.push(Predicate {
            column: ColumnRef::new("employees", "hire_date"),
            operator: Operator::Gt,
            value: Literal::Integer(100000),
        });
        let planner = QueryPlanner::new(Dialect::Postgres, 1000);
        let err = planner.plan(&intent, &catalog()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::TypeMismatch {
                expected: CanonicalType::Date,
                ..
            }
        ));

        let mut intent = QueryIntent::new("employees");
        intent.predicates.push(Predicate {
            column: ColumnRef::new("employees", "emp_id"),
            operator: Operator::Eq,
            value: Literal::Decimal(1.5),
        });
        assert!(matches!(
            planner.plan(&intent, &catalog()),
            Err(EngineError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_contains_binds_wrapped_pattern() {
        let mut intent = QueryIntent::new("employees");
        intent.predicates.push(Predicate {
            column: ColumnRef::new("employees", "position"),
            operator: Operator::Contains,
            value: Literal::Text("Python".to_string()),
        });
        let plan = QueryPlanner::new(Dialect::Postgres, 10)
            .plan(&intent, &catalog())
            .unwrap();
        assert!(plan.sql.contains("LOWER(\"employees\".\"position\") LIKE $1"));
        assert_eq!(plan.params[0], SqlParam::Text("%python%".to_string()));
    }

    #[test]
    fn test_write_request_rejected() {
        let mut intent = QueryIntent::new("employees");
        intent.write_request = Some("delete".to_string());
        let err = QueryPlanner::new(Dialect::Postgres, 10)
            .plan(&intent, &catalog())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedIntent(_)));
    }

    #[test]
    fn test_average_of_text_rejected() {
        let mut intent = QueryIntent::new("employees");
        intent.aggregations.push(Aggregation {
            kind: AggregateKind::Avg,
            target: AggregateTarget::Column {
                column: ColumnRef::new("employees", "position"),
            },
        });
        let err = QueryPlanner::new(Dialect::Postgres, 10)
            .plan(&intent, &catalog())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedIntent(_)));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let mut intent = QueryIntent::new("employees");
        intent.projection.push(ColumnRef::new("employees", "shoe_size"));
        let err = QueryPlanner::new(Dialect::Postgres, 10)
            .plan(&intent, &catalog())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedReference(_)));
    }
}
