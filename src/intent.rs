//! Intent analysis
//!
//! The classifier's JSON is repaired into [`IntentAnalysis`] and then judged
//! locally: clarity is recomputed from the confidence threshold, the
//! classifier's own `is_clear` claim is ignored.

use crate::error::Result;
use crate::llm::NlClassifier;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    pub id: String,
    pub text: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub confidence: f64,
    pub is_clear: bool,
    pub schema_mismatch: bool,
    pub missing_data: Vec<String>,
    pub ambiguities: Vec<String>,
    pub questions: Vec<ClarificationQuestion>,
}

impl IntentAnalysis {
    /// Build an analysis from untrusted classifier JSON. Malformed questions
    /// are dropped, option objects are flattened to their label and the
    /// confidence is clamped to `[0, 1]`.
    pub fn from_classifier_json(value: &Value) -> Self {
        let confidence = match &value["confidence"] {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        };
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let questions = value["questions"]
            .as_array()
            .map(|items| items.iter().filter_map(repair_question).collect())
            .unwrap_or_default();

        Self {
            confidence,
            is_clear: value["is_clear"].as_bool().unwrap_or(false),
            schema_mismatch: value["schema_mismatch"].as_bool().unwrap_or(false),
            missing_data: string_list(&value["missing_data"]),
            ambiguities: string_list(&value["ambiguities"]),
            questions,
        }
    }

    /// Alternatives offered with a schema mismatch.
    pub fn suggestions(&self) -> Vec<String> {
        self.questions
            .first()
            .map(|q| q.options.clone())
            .unwrap_or_default()
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
                _ => None,
            })
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn repair_question(item: &Value) -> Option<ClarificationQuestion> {
    let obj = match item.as_object() {
        Some(obj) => obj,
        None => {
            warn!(question = %item, "dropping clarification question that is not an object");
            return None;
        }
    };
    let id = obj.get("id").and_then(scalar_text);
    let text = obj.get("text").and_then(Value::as_str).map(str::to_string);
    let options = obj.get("options").and_then(Value::as_array);

    match (id, text, options) {
        (Some(id), Some(text), Some(options)) => Some(ClarificationQuestion {
            id,
            text,
            options: options.iter().filter_map(option_label).collect(),
        }),
        _ => {
            warn!(question = %item, "dropping clarification question missing id/text/options");
            None
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn option_label(option: &Value) -> Option<String> {
    match option {
        Value::Object(obj) => ["label", "text", "value", "id"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(scalar_text)),
        other => scalar_text(other),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    Clear(IntentAnalysis),
    NeedsClarification(IntentAnalysis),
    SchemaMismatch {
        missing_data: Vec<String>,
        suggestions: Vec<String>,
    },
}

pub struct IntentAnalyzer {
    confidence_threshold: f64,
}

impl IntentAnalyzer {
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold,
        }
    }

    pub fn judge(&self, mut analysis: IntentAnalysis) -> IntentOutcome {
        analysis.is_clear = analysis.confidence >= self.confidence_threshold;
        if analysis.schema_mismatch {
            return IntentOutcome::SchemaMismatch {
                suggestions: analysis.suggestions(),
                missing_data: analysis.missing_data,
            };
        }
        if analysis.is_clear {
            IntentOutcome::Clear(analysis)
        } else {
            IntentOutcome::NeedsClarification(analysis)
        }
    }

    pub async fn analyze(
        &self,
        classifier: &dyn NlClassifier,
        question: &str,
        schema_summary: &str,
    ) -> Result<IntentOutcome> {
        let analysis = classifier.analyze_intent(question, schema_summary).await?;
        let outcome = self.judge(analysis);
        match &outcome {
            IntentOutcome::Clear(a) => info!(confidence = a.confidence, "intent is clear"),
            IntentOutcome::NeedsClarification(a) => {
                info!(confidence = a.confidence, questions = a.questions.len(), "intent needs clarification")
            }
            IntentOutcome::SchemaMismatch { missing_data, .. } => {
                info!(?missing_data, "question does not fit the schema")
            }
        }
        Ok(outcome)
    }
}

fn time_period_phrase(value: &str) -> Option<&'static str> {
    Some(match value {
        "today" => "for today",
        "yesterday" => "for yesterday",
        "last_week" => "for the last week",
        "last_month" => "for the last month",
        "last_year" => "for the last year",
        "this_month" => "for this month",
        "this_year" => "for this year",
        _ => return None,
    })
}

fn scope_phrase(value: &str) -> Option<&'static str> {
    Some(match value {
        "all" => "for all",
        "by_product" => "by product",
        "by_region" => "by region",
        "by_customer" => "by customer",
        "by_category" => "by category",
        _ => return None,
    })
}

/// Merge clarification answers into the original question without another
/// model call. Known keys map to canonical phrases, anything else is appended
/// verbatim in key order.
pub fn build_clarified_question(original: &str, answers: &BTreeMap<String, String>) -> String {
    let mut parts = vec![original.trim().to_string()];

    if let Some(period) = answers.get("time_period").filter(|v| !v.trim().is_empty()) {
        parts.push(time_period_phrase(period).map(str::to_string).unwrap_or_else(|| period.clone()));
    }
    if let Some(scope) = answers.get("scope").filter(|v| !v.trim().is_empty()) {
        parts.push(scope_phrase(scope).map(str::to_string).unwrap_or_else(|| scope.clone()));
    }
    for (key, value) in answers {
        if key != "time_period" && key != "scope" && !value.trim().is_empty() {
            parts.push(value.trim().to_string());
        }
    }

    parts.join(" ")
}
