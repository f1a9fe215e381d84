//! SQL generation
//!
//! Single-shot generation, self-consistency voting and the one-shot
//! correction call. Everything returned here is parsed but NOT yet validated;
//! the guardrail runs on every statement before execution.

use crate::config::GenerationStrategy;
use crate::error::{ClassifierError, Result};
use crate::llm::parsers::parse_sql;
use crate::llm::NlClassifier;
use crate::voting::{self, SqlCandidate, ValidationResult, MIN_CONSENSUS};
use tracing::{info, warn};

pub const SINGLE_SHOT_TEMPERATURE: f64 = 0.1;
pub const VOTING_TEMPERATURES: [f64; 3] = [0.0, 0.1, 0.15];

pub struct SqlGenerator<'a> {
    classifier: &'a dyn NlClassifier,
}

impl<'a> SqlGenerator<'a> {
    pub fn new(classifier: &'a dyn NlClassifier) -> Self {
        Self { classifier }
    }

    pub async fn generate_with(
        &self,
        strategy: GenerationStrategy,
        question: &str,
        schema_summary: &str,
        row_limit: u32,
    ) -> Result<String> {
        match strategy {
            GenerationStrategy::SingleShot => self.generate(question, schema_summary, row_limit).await,
            GenerationStrategy::Voting => Ok(self
                .generate_with_voting(question, schema_summary, row_limit)
                .await?
                .sql),
        }
    }

    pub async fn generate(&self, question: &str, schema_summary: &str, row_limit: u32) -> Result<String> {
        let raw = self
            .classifier
            .generate_sql(question, schema_summary, row_limit, SINGLE_SHOT_TEMPERATURE)
            .await?;
        Ok(parse_sql(&raw))
    }

    /// Three generations and one validation call, issued concurrently.
    pub async fn generate_with_voting(
        &self,
        question: &str,
        schema_summary: &str,
        row_limit: u32,
    ) -> Result<SqlCandidate> {
        let [t0, t1, t2] = VOTING_TEMPERATURES;
        let (r0, r1, r2, rules) = tokio::join!(
            self.classifier.generate_sql(question, schema_summary, row_limit, t0),
            self.classifier.generate_sql(question, schema_summary, row_limit, t1),
            self.classifier.generate_sql(question, schema_summary, row_limit, t2),
            self.classifier.validate_sql_semantics(question, schema_summary),
        );

        let rules = rules.unwrap_or_else(|e| {
            warn!(error = %e, "semantic validation call failed, voting without rules");
            ValidationResult::permissive()
        });

        let mut candidates = Vec::with_capacity(3);
        let mut first_error = None;
        for (result, temperature) in [(r0, t0), (r1, t1), (r2, t2)] {
            match result {
                Ok(raw) => candidates.push(SqlCandidate::new(parse_sql(&raw), temperature)),
                Err(e) => {
                    warn!(temperature, error = %e, "candidate generation failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match voting::select_best_candidate(candidates, &rules, MIN_CONSENSUS) {
            Some(best) => {
                info!(
                    confidence = best.confidence,
                    validation_passed = best.validation_passed,
                    temperature = best.temperature,
                    "SQL candidate selected"
                );
                Ok(best)
            }
            // No candidate means every generation call failed.
            None => Err(first_error.unwrap_or_else(|| {
                ClassifierError::Malformed("no SQL candidates".to_string()).into()
            })),
        }
    }

    pub async fn correct(
        &self,
        failed_sql: &str,
        error: &str,
        schema_summary: &str,
        row_limit: u32,
    ) -> Result<String> {
        let raw = self
            .classifier
            .correct_sql(failed_sql, error, schema_summary, row_limit)
            .await?;
        Ok(parse_sql(&raw))
    }
}
