//! Query executor
//!
//! Runs an already validated statement on the open schema connection and
//! materialises the result set as JSON values, preserving column order.
//! There is no retry here: correction happens one level up so every
//! execution uses a freshly validated statement.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::mysql::{MySqlConnection, MySqlRow};
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub duration_ms: u64,
}

impl QueryOutput {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

pub async fn execute_readonly(
    conn: &mut MySqlConnection,
    sql: &str,
    timeout: Duration,
) -> Result<QueryOutput> {
    let started = Instant::now();
    debug!(sql, "executing statement");

    let rows = tokio::time::timeout(timeout, sqlx::query(sql).fetch_all(&mut *conn))
        .await
        .map_err(|_| QueryError::Execution(format!("query exceeded {}s", timeout.as_secs())))?
        .map_err(|e| QueryError::Execution(e.to_string()))?;

    let columns: Vec<String> = match rows.first() {
        Some(first) => first.columns().iter().map(|c| c.name().to_string()).collect(),
        // Empty result sets carry no row metadata; ask the server for the shape.
        None => {
            let described = async {
                (&mut *conn)
                    .describe(sql)
                    .await
                    .map(|d| d.columns().iter().map(|c| c.name().to_string()).collect())
            };
            columns_within(timeout, described).await
        }
    };

    let mut materialized = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut cells = Vec::with_capacity(columns.len());
        for idx in 0..row.columns().len() {
            cells.push(decode_cell(row, idx)?);
        }
        materialized.push(cells);
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    info!(rows = materialized.len(), duration_ms, "statement executed");

    Ok(QueryOutput {
        columns,
        rows: materialized,
        duration_ms,
    })
}

/// Column names from `describe`, or none when it fails or overruns `timeout`.
async fn columns_within<F>(timeout: Duration, describe: F) -> Vec<String>
where
    F: Future<Output = std::result::Result<Vec<String>, sqlx::Error>>,
{
    match tokio::time::timeout(timeout, describe).await {
        Ok(Ok(columns)) => columns,
        Ok(Err(e)) => {
            debug!(error = %e, "describe failed, returning no column names");
            Vec::new()
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "describe timed out, returning no column names");
            Vec::new()
        }
    }
}

/// Decode one cell by its declared column type.
fn decode_cell(row: &MySqlRow, idx: usize) -> Result<Value> {
    let raw = row
        .try_get_raw(idx)
        .map_err(|e| QueryError::Execution(format!("cannot read column {}: {}", idx, e)))?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = row.columns()[idx].type_info().name().to_uppercase();

    let value = match type_name.as_str() {
        "BOOLEAN" => row.try_get::<bool, _>(idx).map(Value::from).ok(),
        t if t.ends_with("UNSIGNED") => row.try_get::<u64, _>(idx).map(Value::from).ok(),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            row.try_get::<i64, _>(idx).map(Value::from).ok()
        }
        "FLOAT" | "DOUBLE" => row.try_get::<f64, _>(idx).ok().map(float_value),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|d| Value::String(d.to_string()))
            .ok(),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|d| Value::String(d.format("%Y-%m-%d %H:%M:%S").to_string()))
            .ok(),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
            .try_get::<Vec<u8>, _>(idx)
            .map(|b| Value::String(String::from_utf8_lossy(&b).into_owned()))
            .ok(),
        _ => None,
    };

    // DECIMAL, TIME, JSON, ENUM and text arrive as text in the binary protocol.
    match value {
        Some(v) => Ok(v),
        None => row
            .try_get_unchecked::<String, _>(idx)
            .map(Value::String)
            .or_else(|_| {
                row.try_get_unchecked::<Vec<u8>, _>(idx)
                    .map(|b| Value::String(String::from_utf8_lossy(&b).into_owned()))
            })
            .map_err(|e| QueryError::Execution(format!("cannot decode column {}: {}", idx, e))),
    }
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
