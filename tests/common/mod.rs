//! Shared fixtures: an in-memory HR database and a source wrapper that
//! delays and counts executions.

#![allow(dead_code)]

use async_trait::async_trait;
use nlq_engine::db::{RawSchema, SqliteSource};
use nlq_engine::{
    DatabaseSource, Dialect, EngineConfig, EngineError, QueryEngine, QueryRows, Result, SqlPlan,
};
use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const HR_SCHEMA: &str = "
    CREATE TABLE departments (
        dept_id INTEGER PRIMARY KEY,
        dept_name TEXT NOT NULL
    );
    CREATE TABLE employees (
        emp_id INTEGER PRIMARY KEY,
        full_name VARCHAR(100) NOT NULL,
        dept_id INTEGER REFERENCES departments(dept_id),
        position VARCHAR(100),
        annual_salary NUMERIC(10,2),
        hire_date DATE
    );
    INSERT INTO departments VALUES
        (1, 'Engineering'), (2, 'Sales'), (3, 'Legal'), (4, 'Research');
    INSERT INTO employees VALUES
        (1, 'Ada Lovelace', 1, 'Staff Engineer', 150000, '2019-03-01'),
        (2, 'Grace Hopper', 1, 'Python Developer', 120000, '2021-06-30'),
        (3, 'Linus Pauling', 1, 'Junior Engineer', 90000, '2022-01-10'),
        (4, 'Mary Major', 2, 'Account Executive', 110000, '2018-05-20'),
        (5, 'John Doe', 2, 'Sales Associate', 60000, '2020-11-02'),
        (6, 'Rosalind Franklin', 4, 'Research Scientist', 105000, '2017-09-15');
";

/// HR database plus any extra statements.
pub fn hr_source(extra_sql: &str) -> SqliteSource {
    let conn = Connection::open_in_memory().expect("open in-memory database");
    conn.execute_batch(HR_SCHEMA).expect("create HR schema");
    if !extra_sql.is_empty() {
        conn.execute_batch(extra_sql).expect("apply extra statements");
    }
    SqliteSource::from_connection(conn, "hr test database")
}

pub async fn hr_engine_with(config: EngineConfig, extra_sql: &str) -> QueryEngine {
    let engine = QueryEngine::new(config);
    engine
        .attach(Arc::new(hr_source(extra_sql)))
        .await
        .expect("attach HR database");
    engine
}

pub async fn hr_engine() -> QueryEngine {
    hr_engine_with(EngineConfig::default(), "").await
}

/// Forwards to an inner source, sleeping before every execution. Can be
/// switched to fail executions the way a database error would.
pub struct DelayedSource {
    inner: SqliteSource,
    delay: Duration,
    executions: AtomicUsize,
    failing: AtomicBool,
}

impl DelayedSource {
    pub fn new(inner: SqliteSource, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            executions: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseSource for DelayedSource {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn describe(&self) -> String {
        format!("delayed {}", self.inner.describe())
    }

    async fn introspect(&self) -> Result<RawSchema> {
        self.inner.introspect().await
    }

    async fn distinct_values(&self, table: &str, column: &str, limit: usize) -> Result<Vec<String>> {
        self.inner.distinct_values(table, column, limit).await
    }

    async fn execute(&self, plan: &SqlPlan) -> Result<QueryRows> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Execution("database is locked".to_string()));
        }
        self.inner.execute(plan).await
    }
}
