//! External collaborators the pipeline hands results to
//!
//! Audit and enrichment are optional side effects. Both go through
//! [`best_effort`], which logs a failure and turns it into `None`.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use tracing::{info, warn};

pub const AUDIT_PROMPT_SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub org_id: String,
    pub schema_used: String,
    pub prompt_snippet: String,
    pub sql_text: String,
    pub row_count: Option<u64>,
    pub duration_ms: Option<u64>,
}

impl AuditRecord {
    pub fn new(
        org_id: &str,
        schema_used: &str,
        question: &str,
        sql_text: &str,
        row_count: Option<u64>,
        duration_ms: Option<u64>,
    ) -> Self {
        Self {
            org_id: org_id.to_string(),
            schema_used: schema_used.to_string(),
            prompt_snippet: question.chars().take(AUDIT_PROMPT_SNIPPET_CHARS).collect(),
            sql_text: sql_text.to_string(),
            row_count,
            duration_ms,
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_query(&self, record: AuditRecord) -> Result<()>;
}

/// Audit sink that only emits a log line.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_query(&self, record: AuditRecord) -> Result<()> {
        info!(
            org_id = %record.org_id,
            schema = %record.schema_used,
            rows = ?record.row_count,
            duration_ms = ?record.duration_ms,
            "audit"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub summary: Option<String>,
    pub chart_spec: Option<Value>,
}

impl Insights {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.chart_spec.is_none()
    }
}

/// Produces insight text and chart specs from a result set.
#[async_trait]
pub trait ResultEnricher: Send + Sync {
    async fn enrich(
        &self,
        question: &str,
        columns: &[String],
        rows: &[Vec<Value>],
        business_context: &str,
    ) -> Result<Insights>;
}

/// Await a side effect whose failure must never reach the caller.
pub async fn best_effort<T, F>(label: &str, fut: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(operation = label, error = %e, "best-effort call failed");
            None
        }
    }
}
