//! PostgreSQL source
//!
//! Metadata comes from `information_schema`, row estimates from
//! `pg_class.reltuples`. Every statement runs on a read-only session.

use super::connection::{init_pool, redact, ConnectOptions};
use super::{DatabaseSource, QueryRows, RawColumn, RawForeignKey, RawSchema, RawTable};
use crate::error::{EngineError, Result};
use crate::planner::{Dialect, SqlParam, SqlPlan};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

pub struct PgSource {
    pool: PgPool,
    schema: String,
    description: String,
}

impl PgSource {
    pub async fn connect(database_url: &str, options: &ConnectOptions) -> Result<Self> {
        let pool = init_pool(database_url, options).await?;
        Ok(Self {
            pool,
            schema: options.pg_schema.clone(),
            description: redact(database_url),
        })
    }

    pub fn from_pool(pool: PgPool, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        Self {
            pool,
            description: format!("postgres schema {}", schema),
            schema,
        }
    }

    fn qualified(&self, table: &str) -> String {
        let d = Dialect::Postgres;
        format!("{}.{}", d.quote_ident(&self.schema), d.quote_ident(table))
    }
}

fn introspection_error(e: sqlx::Error) -> EngineError {
    EngineError::Introspection(e.to_string())
}

#[async_trait]
impl DatabaseSource for PgSource {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn introspect(&self) -> Result<RawSchema> {
        let tables: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_name::text, table_type::text
             FROM information_schema.tables
             WHERE table_schema = $1 AND table_type IN ('BASE TABLE', 'VIEW')
             ORDER BY table_name",
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(introspection_error)?;

        let columns: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT table_name::text, column_name::text, data_type::text, is_nullable::text
             FROM information_schema.columns
             WHERE table_schema = $1
             ORDER BY table_name, ordinal_position",
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(introspection_error)?;

        let constraints: Vec<(String, String, String, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT tc.table_name::text, tc.constraint_type::text, kcu.column_name::text,
                        ccu.table_name::text, ccu.column_name::text
                 FROM information_schema.table_constraints tc
                 JOIN information_schema.key_column_usage kcu
                   ON tc.constraint_name = kcu.constraint_name
                  AND tc.table_schema = kcu.table_schema
                 LEFT JOIN information_schema.constraint_column_usage ccu
                   ON tc.constraint_type = 'FOREIGN KEY'
                  AND ccu.constraint_name = tc.constraint_name
                  AND ccu.table_schema = tc.table_schema
                 WHERE tc.table_schema = $1
                   AND tc.constraint_type IN ('PRIMARY KEY', 'FOREIGN KEY')
                 ORDER BY tc.table_name, tc.constraint_name, kcu.ordinal_position",
            )
            .bind(&self.schema)
            .fetch_all(&self.pool)
            .await
            .map_err(introspection_error)?;

        let estimates: Vec<(String, i64)> = sqlx::query_as(
            "SELECT c.relname::text, c.reltuples::int8
             FROM pg_class c
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relkind IN ('r', 'p', 'v', 'm')",
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(introspection_error)?;
        let estimates: HashMap<String, i64> = estimates.into_iter().collect();

        let mut raw: BTreeMap<String, RawTable> = tables
            .into_iter()
            .map(|(name, kind)| {
                let table = RawTable {
                    name: name.clone(),
                    is_view: kind == "VIEW",
                    columns: Vec::new(),
                    primary_key: Vec::new(),
                    foreign_keys: Vec::new(),
                    // reltuples is -1 for never-analyzed tables
                    row_estimate: estimates.get(&name).copied().filter(|n| *n >= 0),
                };
                (name, table)
            })
            .collect();

        for (table, name, data_type, nullable) in columns {
            if let Some(t) = raw.get_mut(&table) {
                t.columns.push(RawColumn {
                    name,
                    declared_type: data_type,
                    nullable: nullable == "YES",
                });
            }
        }

        for (table, kind, column, ref_table, ref_column) in constraints {
            let Some(t) = raw.get_mut(&table) else {
                continue;
            };
            match (kind.as_str(), ref_table) {
                ("PRIMARY KEY", _) => t.primary_key.push(column),
                ("FOREIGN KEY", Some(ref_table)) => t.foreign_keys.push(RawForeignKey {
                    column,
                    ref_table,
                    ref_column,
                }),
                _ => {}
            }
        }

        debug!("Introspected {} relations in schema {}", raw.len(), self.schema);
        Ok(RawSchema {
            tables: raw.into_values().collect(),
        })
    }

    async fn distinct_values(&self, table: &str, column: &str, limit: usize) -> Result<Vec<String>> {
        let col = Dialect::Postgres.quote_ident(column);
        let sql = format!(
            "SELECT DISTINCT {col}::text FROM {table} WHERE {col} IS NOT NULL ORDER BY 1 LIMIT $1",
            col = col,
            table = self.qualified(table)
        );
        let rows: Vec<(Option<String>,)> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(introspection_error)?;
        Ok(rows.into_iter().filter_map(|(v,)| v).collect())
    }

    async fn execute(&self, plan: &SqlPlan) -> Result<QueryRows> {
        let query = plan
            .params
            .iter()
            .fold(sqlx::query(&plan.sql), bind_param);
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::Execution(e.to_string()))?;

        let columns = if plan.output_columns.is_empty() {
            rows.first()
                .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default()
        } else {
            plan.output_columns.clone()
        };
        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|i| pg_value(row, i)).collect::<Result<Vec<_>>>())
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryRows { columns, rows })
    }
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &SqlParam,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        SqlParam::Integer(v) => query.bind(*v),
        SqlParam::Decimal(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.clone()),
        SqlParam::Date(v) => query.bind(*v),
        SqlParam::Boolean(v) => query.bind(*v),
    }
}

/// Decode one cell into JSON by its Postgres type.
fn pg_value(row: &PgRow, idx: usize) -> Result<Value> {
    let column = &row.columns()[idx];
    let type_name = column.type_info().name().to_uppercase();
    let decoded = match type_name.as_str() {
        "INT2" => row.try_get::<Option<i16>, _>(idx).map(|v| v.map(Value::from)),
        "INT4" => row.try_get::<Option<i32>, _>(idx).map(|v| v.map(Value::from)),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(Value::from)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx).map(|v| v.map(|f| Value::from(f as f64))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(Value::from)),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(idx)
            .map(|v| v.map(|d| d.to_f64().map_or_else(|| Value::from(d.to_string()), Value::from))),
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Value::from)),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .map(|v| v.map(|d| Value::from(d.format("%Y-%m-%d").to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .map(|v| v.map(|d| Value::from(d.to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .map(|v| v.map(|d| Value::from(d.to_rfc3339()))),
        _ => row.try_get::<Option<String>, _>(idx).map(|v| v.map(Value::from)),
    };
    cell(column.name(), &type_name, decoded)
}

/// A cell that cannot be decoded fails the whole result.
fn cell(
    column: &str,
    type_name: &str,
    decoded: std::result::Result<Option<Value>, sqlx::Error>,
) -> Result<Value> {
    match decoded {
        Ok(value) => Ok(value.unwrap_or(Value::Null)),
        Err(e) => {
            warn!("Undecodable {} value in column {}: {}", type_name, column, e);
            Err(EngineError::Execution(format!(
                "cannot decode {} value in column '{}': {}",
                type_name, column, e
            )))
        }
    }
}
