//! Completion parsers

use crate::error::ClassifierError;
use crate::guardrail::strip_sql_comments;
use serde_json::Value;
use tracing::debug;

/// Strip a leading markdown fence and its language tag.
fn strip_code_fence<'a>(content: &'a str, tags: &[&str]) -> &'a str {
    let content = content.trim();
    if !content.starts_with("```") {
        return content;
    }
    let mut inner = content
        .split("```")
        .nth(1)
        .unwrap_or_default();
    for tag in tags {
        if let Some(rest) = inner.strip_prefix(tag) {
            inner = rest;
            break;
        }
    }
    inner.trim()
}

/// Reduce a completion to one statement: no fences, no comments, no embedded
/// separators, single-spaced, exactly one trailing `;`.
pub fn parse_sql(response: &str) -> String {
    let content = strip_sql_comments(strip_code_fence(response, &["sql", "SQL"]));
    let without_separators = content.replace(';', "");
    let collapsed = without_separators.split_whitespace().collect::<Vec<_>>().join(" ");
    debug!(sql = %collapsed, "parsed SQL completion");
    format!("{};", collapsed)
}

/// Parse a JSON object out of a completion, tolerating fences and prose
/// around the object.
pub fn parse_json_object(response: &str) -> Result<Value, ClassifierError> {
    let content = strip_code_fence(response, &["json", "JSON"]);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(content) {
        return Ok(value);
    }
    let start = content.find('{');
    let end = content.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => {
            match serde_json::from_str::<Value>(&content[start..=end]) {
                Ok(value @ Value::Object(_)) => Ok(value),
                Ok(_) => Err(ClassifierError::Malformed("expected a JSON object".to_string())),
                Err(e) => Err(ClassifierError::Malformed(format!("invalid JSON: {}", e))),
            }
        }
        _ => Err(ClassifierError::Malformed("no JSON object in completion".to_string())),
    }
}
