//! Schema token index
//!
//! Per organisation, the set of lowercase table and column names of every
//! allowed schema. Built with one batched metadata query and cached with a
//! TTL; concurrent requests share the cache.

use crate::db::connection::SchemaConnector;
use crate::error::Result;
use crate::org::OrgContext;
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"[a-z0-9_]+").expect("static regex");
}

pub type SchemaTokens = HashMap<String, HashSet<String>>;

/// Lowercase alphanumeric tokens of free text.
pub fn tokenize(text: &str) -> HashSet<String> {
    TOKEN
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

struct CachedIndex {
    built_at: Instant,
    schemas: Vec<String>,
    tokens: Arc<SchemaTokens>,
}

pub struct SchemaTokenIndex {
    cache: DashMap<String, CachedIndex>,
    ttl: Duration,
}

impl SchemaTokenIndex {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Tokens per allowed schema, rebuilt when missing, expired or when the
    /// organisation's allowed list changed.
    pub async fn get_or_build(
        &self,
        org: &OrgContext,
        connector: &dyn SchemaConnector,
    ) -> Result<Arc<SchemaTokens>> {
        if let Some(entry) = self.cache.get(&org.org_id) {
            if entry.built_at.elapsed() < self.ttl && entry.schemas == org.allowed_schemas {
                debug!(org_id = %org.org_id, "schema token index cache hit");
                return Ok(entry.tokens.clone());
            }
        }

        let rows = connector.column_names(org, &org.allowed_schemas).await?;
        let mut tokens: SchemaTokens = org
            .allowed_schemas
            .iter()
            .map(|s| (s.clone(), HashSet::new()))
            .collect();
        for (schema, table, column) in rows {
            if let Some(set) = tokens.get_mut(&schema) {
                set.insert(table.to_lowercase());
                set.insert(column.to_lowercase());
            }
        }

        info!(
            org_id = %org.org_id,
            schemas = tokens.len(),
            tokens = tokens.values().map(HashSet::len).sum::<usize>(),
            "schema token index built"
        );
        let tokens = Arc::new(tokens);
        self.cache.insert(
            org.org_id.clone(),
            CachedIndex {
                built_at: Instant::now(),
                schemas: org.allowed_schemas.clone(),
                tokens: tokens.clone(),
            },
        );
        Ok(tokens)
    }
}
