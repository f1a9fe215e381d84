//! Tenant context
//!
//! The organisation record arrives from an external provider with the
//! connection password already decrypted.

use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub driver: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Default database used for cross-schema metadata queries.
    pub database: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgContext {
    pub org_id: String,
    #[serde(default)]
    pub org_name: String,
    pub allowed_schemas: Vec<String>,
    pub connection: ConnectionParams,
    #[serde(default)]
    pub business_context: String,
}

/// Source of tenant context. Lookup and decryption live outside this crate.
#[async_trait]
pub trait OrgContextProvider: Send + Sync {
    async fn load(&self, org_id: &str) -> Result<OrgContext>;
}

/// Provider backed by a fixed set of organisations, e.g. loaded from a file.
pub struct StaticOrgContextProvider {
    orgs: HashMap<String, OrgContext>,
}

impl StaticOrgContextProvider {
    pub fn new(orgs: Vec<OrgContext>) -> Self {
        Self {
            orgs: orgs.into_iter().map(|o| (o.org_id.clone(), o)).collect(),
        }
    }

    /// Load a single organisation or a list of organisations from JSON.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            QueryError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let orgs: Vec<OrgContext> = if value.is_array() {
            serde_json::from_value(value)?
        } else {
            vec![serde_json::from_value(value)?]
        };
        Ok(Self::new(orgs))
    }

    pub fn org_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.orgs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl OrgContextProvider for StaticOrgContextProvider {
    async fn load(&self, org_id: &str) -> Result<OrgContext> {
        let org = self
            .orgs
            .get(org_id)
            .cloned()
            .ok_or_else(|| QueryError::InvalidRequest(format!("unknown organisation '{}'", org_id)))?;
        if org.allowed_schemas.is_empty() {
            return Err(QueryError::Configuration(format!(
                "organisation '{}' has no allowed schemas",
                org_id
            )));
        }
        Ok(org)
    }
}
