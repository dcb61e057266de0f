//! Database collaborators
//!
//! The engine only ever talks to a database through [`DatabaseSource`]:
//! metadata introspection, distinct-value sampling and execution of
//! already-rendered, parameterized SELECT statements.

pub mod connection;
pub mod postgres;
pub mod sqlite;

pub use connection::connect;
pub use postgres::PgSource;
pub use sqlite::SqliteSource;

use crate::error::Result;
use crate::planner::{Dialect, SqlPlan};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Column as reported by the database's own metadata facilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    pub declared_type: String,
    pub nullable: bool,
}

/// Declared foreign key. `ref_column` is `None` when the database lets the
/// key implicitly reference the target's primary key (SQLite).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawForeignKey {
    pub column: String,
    pub ref_table: String,
    pub ref_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub name: String,
    pub is_view: bool,
    pub columns: Vec<RawColumn>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<RawForeignKey>,
    pub row_estimate: Option<i64>,
}

/// Unvalidated introspection output; only the catalog builder reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSchema {
    pub tables: Vec<RawTable>,
}

/// Tabular query result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&serde_json::Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

#[async_trait]
pub trait DatabaseSource: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Human readable description without credentials.
    fn describe(&self) -> String;

    async fn introspect(&self) -> Result<RawSchema>;

    /// Up to `limit` distinct non-null values of a column, rendered as text.
    async fn distinct_values(&self, table: &str, column: &str, limit: usize)
        -> Result<Vec<String>>;

    /// Execute a read-only statement. Dropping the returned future cancels
    /// the query.
    async fn execute(&self, plan: &SqlPlan) -> Result<QueryRows>;
}
