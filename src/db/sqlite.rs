//! SQLite source
//!
//! Introspects through `sqlite_master` and the table-valued pragmas. All
//! work runs on the blocking pool; a query whose future is dropped (timeout,
//! client gone) is interrupted through the connection's interrupt handle.

use super::{DatabaseSource, QueryRows, RawColumn, RawForeignKey, RawSchema, RawTable};
use crate::error::{EngineError, Result};
use crate::planner::{Dialect, SqlParam, SqlPlan};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, InterruptHandle, OpenFlags};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub struct SqliteSource {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    /// Id of the call currently holding the connection.
    running: Arc<Mutex<Option<u64>>>,
    next_call: AtomicU64,
    description: String,
}

impl SqliteSource {
    /// Open `sqlite::memory:`, `sqlite://path` or `sqlite:path`. Files are
    /// opened read-only.
    pub fn open(url: &str) -> Result<Self> {
        let target = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);

        let conn = if target.is_empty() || target == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open_with_flags(
                target,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
            )
        }
        .map_err(|e| EngineError::Connection(format!("{}: {}", target, e)))?;

        Ok(Self::from_connection(conn, format!("sqlite {}", target)))
    }

    /// Wrap an already open connection.
    pub fn from_connection(conn: Connection, description: impl Into<String>) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            running: Arc::new(Mutex::new(None)),
            next_call: AtomicU64::new(1),
            description: description.into(),
        }
    }

    /// Run `work` on the blocking pool holding the connection.
    ///
    /// Dropping the returned future interrupts `work` only while it owns the
    /// connection; a call dropped while still queued never starts.
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut guard = CancelOnDrop {
            id,
            handle: Arc::clone(&self.interrupt),
            running: Arc::clone(&self.running),
            cancelled: Arc::clone(&cancelled),
            armed: true,
        };

        let conn = Arc::clone(&self.conn);
        let running = Arc::clone(&self.running);
        let task = move || {
            let conn = conn.lock();
            {
                let mut slot = running.lock();
                if cancelled.load(Ordering::SeqCst) {
                    debug!("Skipping sqlite call {} abandoned while queued", id);
                    return Err(EngineError::Execution("cancelled before start".to_string()));
                }
                *slot = Some(id);
            }
            let result = work(&conn);
            *running.lock() = None;
            result
        };

        let result = tokio::task::spawn_blocking(task)
            .await
            .map_err(|e| EngineError::Execution(format!("sqlite worker failed: {}", e)));
        guard.armed = false;
        result?
    }
}

/// Cancels a call whose future is dropped before its blocking work
/// finished: a queued call is marked so it never starts, a running one is
/// interrupted.
struct CancelOnDrop {
    id: u64,
    handle: Arc<InterruptHandle>,
    running: Arc<Mutex<Option<u64>>>,
    cancelled: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Checked under the same lock the worker takes before starting.
        let running = self.running.lock();
        self.cancelled.store(true, Ordering::SeqCst);
        if *running == Some(self.id) {
            debug!("Interrupting abandoned sqlite call {}", self.id);
            self.handle.interrupt();
        }
    }
}

fn introspection_error(e: rusqlite::Error) -> EngineError {
    EngineError::Introspection(e.to_string())
}

#[async_trait]
impl DatabaseSource for SqliteSource {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn introspect(&self) -> Result<RawSchema> {
        self.blocking(|conn| introspect(conn).map_err(introspection_error))
            .await
    }

    async fn distinct_values(&self, table: &str, column: &str, limit: usize) -> Result<Vec<String>> {
        let d = Dialect::Sqlite;
        let col = d.quote_ident(column);
        let sql = format!(
            "SELECT DISTINCT CAST({col} AS TEXT) FROM {table} WHERE {col} IS NOT NULL ORDER BY 1 LIMIT ?1",
            col = col,
            table = d.quote_ident(table)
        );
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(introspection_error)?;
            let values = stmt
                .query_map([limit as i64], |row| row.get::<_, Option<String>>(0))
                .map_err(introspection_error)?
                .filter_map(|v| v.transpose())
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(introspection_error)?;
            Ok(values)
        })
        .await
    }

    async fn execute(&self, plan: &SqlPlan) -> Result<QueryRows> {
        let plan = plan.clone();
        self.blocking(move |conn| run_query(conn, &plan)).await
    }
}

fn introspect(conn: &Connection) -> rusqlite::Result<RawSchema> {
    let mut stmt = conn.prepare(
        "SELECT name, type FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let relations = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tables = Vec::with_capacity(relations.len());
    for (name, kind) in relations {
        let mut columns = Vec::new();
        let mut primary_key: Vec<(i64, String)> = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let mut rows = stmt.query([&name])?;
        while let Some(row) = rows.next()? {
            let column: String = row.get(0)?;
            let declared_type: String = row.get::<_, Option<String>>(1)?.unwrap_or_default();
            let not_null: bool = row.get::<_, i64>(2)? != 0;
            let pk: i64 = row.get(3)?;
            if pk > 0 {
                primary_key.push((pk, column.clone()));
            }
            columns.push(RawColumn {
                name: column,
                declared_type,
                nullable: !not_null && pk == 0,
            });
        }
        primary_key.sort();

        let mut stmt = conn.prepare(
            "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
        )?;
        let foreign_keys = stmt
            .query_map([&name], |row| {
                Ok(RawForeignKey {
                    column: row.get(0)?,
                    ref_table: row.get(1)?,
                    ref_column: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let is_view = kind == "view";
        let row_estimate = if is_view {
            None
        } else {
            let sql = format!("SELECT COUNT(*) FROM {}", Dialect::Sqlite.quote_ident(&name));
            conn.query_row(&sql, [], |row| row.get::<_, i64>(0)).ok()
        };

        tables.push(RawTable {
            name,
            is_view,
            columns,
            primary_key: primary_key.into_iter().map(|(_, c)| c).collect(),
            foreign_keys,
            row_estimate,
        });
    }

    Ok(RawSchema { tables })
}

fn run_query(conn: &Connection, plan: &SqlPlan) -> Result<QueryRows> {
    let execution_error = |e: rusqlite::Error| EngineError::Execution(e.to_string());

    let mut stmt = conn.prepare(&plan.sql).map_err(execution_error)?;
    let column_count = stmt.column_count();
    let columns = if plan.output_columns.len() == column_count {
        plan.output_columns.clone()
    } else {
        stmt.column_names().into_iter().map(String::from).collect()
    };

    let params: Vec<SqlValue> = plan.params.iter().map(sqlite_param).collect();
    let mut rows = stmt
        .query(params_from_iter(params.iter()))
        .map_err(execution_error)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(execution_error)? {
        let mut values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            let value = row.get_ref(idx).map_err(execution_error)?;
            values.push(json_value(value));
        }
        out.push(values);
    }

    Ok(QueryRows { columns, rows: out })
}

fn sqlite_param(param: &SqlParam) -> SqlValue {
    match param {
        SqlParam::Integer(v) => SqlValue::Integer(*v),
        SqlParam::Decimal(v) => SqlValue::Real(*v),
        SqlParam::Text(v) => SqlValue::Text(v.clone()),
        SqlParam::Date(v) => SqlValue::Text(v.format("%Y-%m-%d").to_string()),
        SqlParam::Boolean(v) => SqlValue::Integer(i64::from(*v)),
    }
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::from(v),
        ValueRef::Real(v) => Value::from(v),
        ValueRef::Text(bytes) => Value::from(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::from(format!("<{} bytes>", bytes.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn source() -> SqliteSource {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE departments (dept_id INTEGER PRIMARY KEY, dept_name TEXT NOT NULL);
             CREATE TABLE employees (
                 emp_id INTEGER PRIMARY KEY,
                 full_name VARCHAR(100),
                 dept_id INTEGER REFERENCES departments,
                 annual_salary NUMERIC(10,2)
             );
             CREATE VIEW engineers AS SELECT * FROM employees WHERE dept_id = 1;
             INSERT INTO departments VALUES (1, 'Engineering'), (2, 'Sales');
             INSERT INTO employees VALUES (1, 'Ada', 1, 120000), (2, 'Bob', 2, 80000);",
        )
        .unwrap();
        SqliteSource::from_connection(conn, "test")
    }

    #[tokio::test]
    async fn test_introspect() {
        let raw = source().introspect().await.unwrap();
        let names: Vec<&str> = raw.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["departments", "employees", "engineers"]);

        let employees = &raw.tables[1];
        assert_eq!(employees.primary_key, vec!["emp_id"]);
        assert_eq!(employees.row_estimate, Some(2));
        assert_eq!(employees.columns[1].declared_type, "VARCHAR(100)");
        assert_eq!(employees.foreign_keys.len(), 1);
        assert_eq!(employees.foreign_keys[0].ref_table, "departments");
        // No column named: implicitly the target's primary key.
        assert_eq!(employees.foreign_keys[0].ref_column, None);

        assert!(raw.tables[2].is_view);
    }

    #[tokio::test]
    async fn test_distinct_values() {
        let values = source()
            .distinct_values("departments", "dept_name", 10)
            .await
            .unwrap();
        assert_eq!(values, vec!["Engineering", "Sales"]);
    }

    #[tokio::test]
    async fn test_execute_binds_numbered_params() {
        let plan = SqlPlan {
            sql: "SELECT \"full_name\" AS \"full_name\" FROM \"employees\" WHERE \"annual_salary\" > ?1 ORDER BY \"emp_id\" ASC LIMIT ?2".to_string(),
            params: vec![SqlParam::Decimal(100000.0), SqlParam::Integer(10)],
            dialect: Dialect::Sqlite,
            output_columns: vec!["full_name".to_string()],
        };
        let rows = source().execute(&plan).await.unwrap();
        assert_eq!(rows.columns, vec!["full_name"]);
        assert_eq!(rows.rows, vec![vec![Value::from("Ada")]]);
    }

    #[tokio::test]
    async fn test_execution_error_is_reported() {
        let plan = SqlPlan {
            sql: "SELECT \"nope\" FROM \"employees\"".to_string(),
            params: vec![],
            dialect: Dialect::Sqlite,
            output_columns: vec![],
        };
        let err = source().execute(&plan).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    const SLOW_COUNT: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 2000000) SELECT COUNT(*) FROM c";

    fn raw_plan(sql: &str) -> SqlPlan {
        SqlPlan {
            sql: sql.to_string(),
            params: vec![],
            dialect: Dialect::Sqlite,
            output_columns: vec![],
        }
    }

    #[tokio::test]
    async fn test_dropped_queued_call_leaves_running_query_alone() {
        let source = Arc::new(source());
        let slow = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.execute(&raw_plan(SLOW_COUNT)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = tokio::time::timeout(
            Duration::from_millis(30),
            source.execute(&raw_plan("SELECT 1")),
        )
        .await;
        assert!(queued.is_err());

        let rows = slow.await.unwrap().unwrap();
        assert_eq!(rows.rows, vec![vec![Value::from(2000000)]]);

        let rows = source.execute(&raw_plan("SELECT 1")).await.unwrap();
        assert_eq!(rows.rows, vec![vec![Value::from(1)]]);
    }

    #[tokio::test]
    async fn test_dropped_running_call_is_interrupted() {
        let source = source();
        let endless = SLOW_COUNT.replace("2000000", "2000000000");
        let started = std::time::Instant::now();
        let slow = tokio::time::timeout(
            Duration::from_millis(30),
            source.execute(&raw_plan(&endless)),
        )
        .await;
        assert!(slow.is_err());

        // Waits for the interrupted statement to release the connection.
        let rows = source.execute(&raw_plan("SELECT 1")).await.unwrap();
        assert_eq!(rows.rows, vec![vec![Value::from(1)]]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
