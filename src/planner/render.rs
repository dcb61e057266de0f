//! SQL rendering
//!
//! Turns a [`LogicalPlan`] into dialect-specific SQL text. Every identifier
//! is double-quoted and every value becomes a numbered placeholder.

use super::{AggregateArg, LogicalPlan, SelectItem, SqlParam, SqlPlan};
use crate::catalog::ColumnRef;
use crate::intent::{Direction, Operator};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Placeholder for the 1-based parameter `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => format!("?{}", n),
        }
    }

    pub fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => f.write_str("postgres"),
            Dialect::Sqlite => f.write_str("sqlite"),
        }
    }
}

struct Renderer {
    dialect: Dialect,
    params: Vec<SqlParam>,
}

impl Renderer {
    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        self.dialect.placeholder(self.params.len())
    }

    fn column(&self, column: &ColumnRef) -> String {
        format!(
            "{}.{}",
            self.dialect.quote_ident(&column.table),
            self.dialect.quote_ident(&column.column)
        )
    }
}

pub fn render(plan: &LogicalPlan, dialect: Dialect) -> SqlPlan {
    let mut r = Renderer {
        dialect,
        params: Vec::new(),
    };

    let select: Vec<String> = plan
        .projection
        .iter()
        .map(|item| match item {
            SelectItem::Column { column, alias } => {
                format!("{} AS {}", r.column(column), dialect.quote_ident(alias))
            }
            SelectItem::Aggregate { kind, arg, alias } => {
                let arg = match arg {
                    AggregateArg::Star => "*".to_string(),
                    AggregateArg::Column(column) => r.column(column),
                };
                format!("{}({}) AS {}", kind.sql_name(), arg, dialect.quote_ident(alias))
            }
        })
        .collect();

    let mut sql = format!(
        "SELECT {} FROM {}",
        select.join(", "),
        dialect.quote_ident(&plan.from)
    );

    for (step, kind) in &plan.joins {
        sql.push_str(&format!(
            " {} {} ON {} = {}",
            kind.as_sql(),
            dialect.quote_ident(&step.right_table),
            r.column(&ColumnRef::new(step.left_table.clone(), step.left_column.clone())),
            r.column(&ColumnRef::new(step.right_table.clone(), step.right_column.clone())),
        ));
    }

    if !plan.selection.is_empty() {
        let conditions: Vec<String> = plan
            .selection
            .iter()
            .map(|p| {
                let column = r.column(&p.column);
                let placeholder = r.bind(p.param.clone());
                match p.operator {
                    Operator::Contains => format!("LOWER({}) LIKE {}", column, placeholder),
                    op => format!("{} {} {}", column, op, placeholder),
                }
            })
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if !plan.group_by.is_empty() {
        let columns: Vec<String> = plan.group_by.iter().map(|c| r.column(c)).collect();
        sql.push_str(" GROUP BY ");
        sql.push_str(&columns.join(", "));
    }

    if !plan.order_by.is_empty() {
        let keys: Vec<String> = plan
            .order_by
            .iter()
            .map(|o| {
                let direction = match o.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                format!("{} {}", r.column(&o.column), direction)
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }

    if let Some(limit) = plan.limit {
        let placeholder = r.bind(SqlParam::Integer(limit.min(i64::MAX as u64) as i64));
        sql.push_str(" LIMIT ");
        sql.push_str(&placeholder);
    }

    SqlPlan {
        sql,
        params: r.params,
        dialect,
        output_columns: plan.projection.iter().map(|i| i.alias().to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::Sqlite.placeholder(1), "?1");
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(Dialect::Postgres.quote_ident("order"), "\"order\"");
        assert_eq!(Dialect::Sqlite.quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
