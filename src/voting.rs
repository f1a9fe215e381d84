//! Self-consistency voting over SQL candidates
//!
//! Candidates are compared in a normalised form, the majority wins and an
//! independent set of semantic rules is used as a soft check. The rules are
//! heuristic and never block a result on their own.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, warn};

pub const MIN_CONSENSUS: usize = 2;
const ALTERNATIVE_CONFIDENCE: f64 = 0.5;

lazy_static! {
    static ref LINE_COMMENT: Regex = Regex::new(r"--[^\n]*").expect("static regex");
    static ref BLOCK_COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/").expect("static regex");
    static ref WORD: Regex = Regex::new(r"[a-z0-9_]+").expect("static regex");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCandidate {
    pub sql: String,
    pub temperature: f64,
    pub confidence: f64,
    pub validation_passed: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl SqlCandidate {
    pub fn new(sql: impl Into<String>, temperature: f64) -> Self {
        Self {
            sql: sql.into(),
            temperature,
            confidence: 0.0,
            validation_passed: false,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub must_include: Vec<String>,
    pub must_not: Vec<String>,
    pub suggestions: Vec<String>,
    pub confidence: f64,
}

impl ValidationResult {
    /// Rules that accept any statement. Used when the validation call fails.
    pub fn permissive() -> Self {
        Self {
            is_valid: true,
            ..Self::default()
        }
    }

    /// Read rules from classifier JSON. Returns `None` when no rule list is
    /// present at all.
    pub fn from_classifier_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if !obj.contains_key("must_include") && !obj.contains_key("must_not") {
            return None;
        }
        let list = |key: &str| -> Vec<String> {
            obj.get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        Some(Self {
            is_valid: obj.get("is_valid").and_then(Value::as_bool).unwrap_or(true),
            must_include: list("must_include"),
            must_not: list("must_not"),
            suggestions: list("suggestions"),
            confidence: obj
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
                .clamp(0.0, 1.0),
        })
    }
}

/// Comparable form of a statement: no comments, single spaces, no trailing
/// terminator, lowercase.
pub fn normalize_sql(sql: &str) -> String {
    let without_block = BLOCK_COMMENT.replace_all(sql, " ");
    let without_line = LINE_COMMENT.replace_all(&without_block, " ");
    let collapsed = without_line.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_end_matches(';').trim_end().to_lowercase()
}

/// Majority vote. Ties between groups go to the group seen first, and the
/// representative of the winning group is its lowest-temperature member.
/// Returns the index of the winner and its vote count.
pub fn vote_best_sql(candidates: &[SqlCandidate]) -> Option<(usize, usize)> {
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (idx, candidate) in candidates.iter().enumerate() {
        let key = normalize_sql(&candidate.sql);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(idx),
            None => groups.push((key, vec![idx])),
        }
    }

    let mut best: Option<&(String, Vec<usize>)> = None;
    for group in &groups {
        if best.map_or(true, |b| group.1.len() > b.1.len()) {
            best = Some(group);
        }
    }
    let (_, members) = best?;
    let winner = members.iter().copied().min_by(|a, b| {
        candidates[*a]
            .temperature
            .total_cmp(&candidates[*b].temperature)
    })?;

    info!(votes = members.len(), total = candidates.len(), "SQL vote result");
    Some((winner, members.len()))
}

fn words(text: &str) -> Vec<String> {
    WORD.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Check a statement against semantic rules. A `must_not` rule fails when any
/// of its significant words appears as a whole word in the SQL. A
/// `must_include` rule passes when any significant word is evidenced in the
/// SQL, either as a word or inside an identifier.
pub fn validate_against_rules(sql: &str, rules: &ValidationResult) -> bool {
    let sql_words: HashSet<String> = words(sql).into_iter().collect();

    for pattern in &rules.must_not {
        if let Some(hit) = words(pattern)
            .into_iter()
            .filter(|w| w.len() > 3)
            .find(|w| sql_words.contains(w))
        {
            warn!(pattern = %pattern, word = %hit, "forbidden pattern present");
            return false;
        }
    }

    let missing: Vec<&String> = rules
        .must_include
        .iter()
        .filter(|pattern| {
            let significant: Vec<String> =
                words(pattern).into_iter().filter(|w| w.len() > 3).collect();
            !significant.is_empty()
                && !significant
                    .iter()
                    .any(|w| sql_words.iter().any(|s| s.contains(w.as_str())))
        })
        .collect();
    if !missing.is_empty() {
        warn!(?missing, "required patterns missing");
        return false;
    }
    true
}

/// Pick the candidate to run.
///
/// The majority winner is taken when it has at least `min_consensus` votes and
/// passes the rules. Otherwise the first other candidate that passes is taken
/// with a fixed lower confidence. Failing both, the majority winner is
/// returned anyway.
pub fn select_best_candidate(
    mut candidates: Vec<SqlCandidate>,
    rules: &ValidationResult,
    min_consensus: usize,
) -> Option<SqlCandidate> {
    let (winner_idx, votes) = vote_best_sql(&candidates)?;
    let total = candidates.len();
    let winner_norm = normalize_sql(&candidates[winner_idx].sql);

    let winner_valid = validate_against_rules(&candidates[winner_idx].sql, rules);
    {
        let winner = &mut candidates[winner_idx];
        winner.confidence = votes as f64 / total as f64;
        winner.validation_passed = winner_valid;
        if !winner_valid {
            winner.errors.push("semantic rules not satisfied".to_string());
        }
        if votes < min_consensus {
            winner.errors.push(format!("no consensus ({} of {} votes)", votes, total));
        }
    }

    if votes >= min_consensus && winner_valid {
        info!(votes, total, "consensus reached and rules satisfied");
        return Some(candidates.swap_remove(winner_idx));
    }

    for idx in 0..total {
        if idx == winner_idx || normalize_sql(&candidates[idx].sql) == winner_norm {
            continue;
        }
        if validate_against_rules(&candidates[idx].sql, rules) {
            info!(temperature = candidates[idx].temperature, "alternative candidate satisfies rules");
            let mut alternative = candidates.swap_remove(idx);
            alternative.validation_passed = true;
            alternative.confidence = ALTERNATIVE_CONFIDENCE;
            return Some(alternative);
        }
    }

    warn!(votes, total, "returning majority winner without rule agreement");
    Some(candidates.swap_remove(winner_idx))
}
