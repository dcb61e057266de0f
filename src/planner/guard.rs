//! Read-only guard
//!
//! Every rendered statement is parsed back before it leaves the planner. It
//! must be a single query and must carry no inline literal values; anything
//! else means the renderer produced something it never should.

use super::Dialect;
use crate::error::{EngineError, Result};
use sqlparser::ast::{visit_expressions, Expr, Statement, Value};
use sqlparser::dialect::{PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::ops::ControlFlow;
use tracing::warn;

pub fn check_read_only(sql: &str, dialect: Dialect) -> Result<()> {
    let parsed = match dialect {
        Dialect::Postgres => Parser::parse_sql(&PostgreSqlDialect {}, sql),
        Dialect::Sqlite => Parser::parse_sql(&SQLiteDialect {}, sql),
    };
    let statements = parsed.map_err(|e| {
        warn!("Generated SQL failed to parse: {}", e);
        EngineError::UnsupportedIntent(format!("generated SQL could not be parsed: {}", e))
    })?;

    match statements.as_slice() {
        [Statement::Query(_)] => {}
        _ => {
            return Err(EngineError::UnsupportedIntent(
                "generated SQL must be exactly one SELECT statement".to_string(),
            ))
        }
    }

    let inline = visit_expressions(&statements, |expr| match expr {
        Expr::Value(Value::Placeholder(_)) | Expr::Value(Value::Null) => ControlFlow::Continue(()),
        Expr::Value(value) => ControlFlow::Break(value.to_string()),
        _ => ControlFlow::Continue(()),
    });
    if let ControlFlow::Break(literal) = inline {
        return Err(EngineError::UnsupportedIntent(format!(
            "generated SQL contains inline literal {}",
            literal
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_parameterized_select() {
        let sql = "SELECT \"e\".\"name\" AS \"name\" FROM \"e\" WHERE \"e\".\"salary\" > $1 LIMIT $2";
        assert!(check_read_only(sql, Dialect::Postgres).is_ok());
        let sql = "SELECT COUNT(*) AS \"count\" FROM \"e\" WHERE LOWER(\"e\".\"role\") LIKE ?1";
        assert!(check_read_only(sql, Dialect::Sqlite).is_ok());
    }

    #[test]
    fn test_rejects_inline_literals() {
        let sql = "SELECT * FROM \"e\" WHERE \"e\".\"salary\" > 100000";
        assert!(check_read_only(sql, Dialect::Postgres).is_err());
        let sql = "SELECT * FROM \"e\" WHERE \"e\".\"name\" = 'x'";
        assert!(check_read_only(sql, Dialect::Sqlite).is_err());
    }

    #[test]
    fn test_rejects_writes_and_batches() {
        assert!(check_read_only("DELETE FROM \"e\" WHERE \"e\".\"id\" = $1", Dialect::Postgres).is_err());
        assert!(check_read_only("SELECT * FROM \"e\"; DROP TABLE \"e\"", Dialect::Postgres).is_err());
    }
}
