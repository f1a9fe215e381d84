//! Audit trail stored in MySQL

use crate::collaborators::{AuditRecord, AuditSink};
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tracing::info;

pub struct SqlAuditSink {
    pool: MySqlPool,
}

impl SqlAuditSink {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| QueryError::Connection(format!("audit database: {}", e)))?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl AuditSink for SqlAuditSink {
    async fn log_query(&self, record: AuditRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO query_audit
                (org_id, schema_used, prompt_snip, sql_text, row_count, duration_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, UTC_TIMESTAMP())
            "#,
        )
        .bind(&record.org_id)
        .bind(&record.schema_used)
        .bind(&record.prompt_snippet)
        .bind(&record.sql_text)
        .bind(record.row_count)
        .bind(record.duration_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| QueryError::AuditWrite(e.to_string()))?;

        info!(
            org_id = %record.org_id,
            schema = %record.schema_used,
            rows = ?record.row_count,
            "audit row written"
        );
        Ok(())
    }
}
