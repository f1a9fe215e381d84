//! NL classifier seam
//!
//! The pipeline depends on five model calls. [`NlClassifier`] names them so
//! the orchestrator can run against a scripted implementation in tests and
//! against [`LlmClassifier`] in production.

use crate::error::{ClassifierError, Result};
use crate::intent::IntentAnalysis;
use crate::llm::client::LlmClient;
use crate::llm::{parsers, prompts};
use crate::voting::ValidationResult;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

pub const INTENT_TEMPERATURE: f64 = 0.2;
pub const VALIDATION_TEMPERATURE: f64 = 0.2;
pub const CORRECTION_TEMPERATURE: f64 = 0.1;

const INTENT_MAX_TOKENS: u32 = 500;
const PICK_SCHEMA_MAX_TOKENS: u32 = 10;
const SQL_MAX_TOKENS: u32 = 800;

lazy_static! {
    static ref WORD: Regex = Regex::new(r"[A-Za-z0-9_]+").expect("static regex");
}

#[async_trait]
pub trait NlClassifier: Send + Sync {
    /// Name one schema for the question. The answer is only a hint; callers
    /// match it against the allowed list themselves.
    async fn pick_schema(&self, allowed: &[String], question: &str) -> Result<Option<String>>;

    async fn analyze_intent(&self, question: &str, schema_summary: &str) -> Result<IntentAnalysis>;

    /// Raw completion for a SQL generation request.
    async fn generate_sql(
        &self,
        question: &str,
        schema_summary: &str,
        row_limit: u32,
        temperature: f64,
    ) -> Result<String>;

    async fn correct_sql(
        &self,
        failed_sql: &str,
        error: &str,
        schema_summary: &str,
        row_limit: u32,
    ) -> Result<String>;

    async fn validate_sql_semantics(
        &self,
        question: &str,
        schema_summary: &str,
    ) -> Result<ValidationResult>;
}

pub struct LlmClassifier {
    client: LlmClient,
}

impl LlmClassifier {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NlClassifier for LlmClassifier {
    async fn pick_schema(&self, allowed: &[String], question: &str) -> Result<Option<String>> {
        let answer = self
            .client
            .complete(&prompts::pick_schema(allowed, question), 0.0, PICK_SCHEMA_MAX_TOKENS)
            .await?;
        let picked = WORD.find(&answer).map(|m| m.as_str().to_string());
        debug!(?picked, "classifier schema pick");
        Ok(picked)
    }

    async fn analyze_intent(&self, question: &str, schema_summary: &str) -> Result<IntentAnalysis> {
        let raw = self
            .client
            .complete(
                &prompts::intent_analysis(question, schema_summary),
                INTENT_TEMPERATURE,
                INTENT_MAX_TOKENS,
            )
            .await?;
        let value = parsers::parse_json_object(&raw)?;
        Ok(IntentAnalysis::from_classifier_json(&value))
    }

    async fn generate_sql(
        &self,
        question: &str,
        schema_summary: &str,
        row_limit: u32,
        temperature: f64,
    ) -> Result<String> {
        let raw = self
            .client
            .complete(
                &prompts::sql_generation(question, schema_summary, row_limit),
                temperature,
                SQL_MAX_TOKENS,
            )
            .await?;
        Ok(raw)
    }

    async fn correct_sql(
        &self,
        failed_sql: &str,
        error: &str,
        schema_summary: &str,
        row_limit: u32,
    ) -> Result<String> {
        let raw = self
            .client
            .complete(
                &prompts::sql_correction(failed_sql, error, schema_summary, row_limit),
                CORRECTION_TEMPERATURE,
                SQL_MAX_TOKENS,
            )
            .await?;
        Ok(raw)
    }

    async fn validate_sql_semantics(
        &self,
        question: &str,
        schema_summary: &str,
    ) -> Result<ValidationResult> {
        let raw = self
            .client
            .complete(
                &prompts::sql_validation(question, schema_summary),
                VALIDATION_TEMPERATURE,
                SQL_MAX_TOKENS,
            )
            .await?;
        let value = parsers::parse_json_object(&raw)?;
        ValidationResult::from_classifier_json(&value)
            .ok_or_else(|| ClassifierError::Malformed("validation rules missing".to_string()).into())
    }
}
