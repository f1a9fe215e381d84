//! Schema selection
//!
//! Ranks allowed schemas by token overlap with the question. When the ranking
//! is inconclusive the classifier is asked to pick one; its answer only counts
//! when it names an allowed schema exactly (ignoring case).

use crate::llm::NlClassifier;
use crate::org::OrgContext;
use crate::schema_index::{tokenize, SchemaTokens};
use std::cmp::Reverse;
use tracing::{info, warn};

/// (schema, score) ordered by score descending, then name ascending.
pub fn rank_schemas_by_overlap(
    allowed: &[String],
    index: &SchemaTokens,
    question: &str,
) -> Vec<(String, usize)> {
    let question_tokens = tokenize(question);
    let mut ranked: Vec<(String, usize)> = allowed
        .iter()
        .map(|schema| {
            let score = index
                .get(schema)
                .map(|tokens| tokens.intersection(&question_tokens).count())
                .unwrap_or(0);
            (schema.clone(), score)
        })
        .collect();
    ranked.sort_by_key(|(name, score)| (Reverse(*score), name.to_lowercase()));
    ranked
}

/// Whether the overlap ranking cannot decide on its own.
pub fn is_inconclusive(ranked: &[(String, usize)]) -> bool {
    match ranked {
        [] => false,
        [(_, top)] => *top == 0,
        [(_, top), (_, second), ..] => *top == 0 || top == second,
    }
}

/// Match a classifier answer against the allowed list.
pub fn match_allowed(allowed: &[String], answer: &str) -> Option<String> {
    let answer = answer.trim();
    allowed.iter().find(|s| s.eq_ignore_ascii_case(answer)).cloned()
}

/// Preferred schema first, then every other allowed schema in ranking order.
pub async fn schema_try_order(
    org: &OrgContext,
    index: &SchemaTokens,
    question: &str,
    classifier: &dyn NlClassifier,
) -> Vec<String> {
    let ranked = rank_schemas_by_overlap(&org.allowed_schemas, index, question);
    let Some((leader, top_score)) = ranked.first().cloned() else {
        return Vec::new();
    };

    let mut preferred = leader.clone();
    if is_inconclusive(&ranked) {
        match classifier.pick_schema(&org.allowed_schemas, question).await {
            Ok(Some(answer)) => match match_allowed(&org.allowed_schemas, &answer) {
                Some(picked) => preferred = picked,
                None => warn!(answer = %answer, "classifier picked a schema outside the allowed list"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "schema pick failed, using overlap leader"),
        }
    }

    info!(
        org_id = %org.org_id,
        preferred = %preferred,
        top_score,
        "schema try-order decided"
    );

    let mut order = vec![preferred.clone()];
    order.extend(
        ranked
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| *name != preferred),
    );
    order
}

/// Try-order for a clarified question: the session's schema first, then the
/// remaining allowed schemas in their configured order.
pub fn clarification_try_order(org: &OrgContext, session_schema: &str) -> Vec<String> {
    let mut order = Vec::with_capacity(org.allowed_schemas.len());
    if let Some(first) = match_allowed(&org.allowed_schemas, session_schema) {
        order.push(first);
    }
    for schema in &org.allowed_schemas {
        if !order.contains(schema) {
            order.push(schema.clone());
        }
    }
    order
}
