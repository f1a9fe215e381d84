//! Runtime settings
//!
//! Loaded from the environment (after `.env` is applied by the binary). Every
//! value has a default so tests and local runs need no configuration.

use crate::error::{QueryError, Result};
use std::str::FromStr;
use std::time::Duration;

/// Which chat-completions dialect the LLM endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Azure,
}

impl FromStr for LlmProvider {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "azure" => Ok(LlmProvider::Azure),
            other => Err(QueryError::Configuration(format!("unknown LLM provider '{}'", other))),
        }
    }
}

/// When the generator runs self-consistency voting instead of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStrategy {
    /// Three candidates plus one semantic validation call on every first pass.
    Voting,
    SingleShot,
}

impl FromStr for GenerationStrategy {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "voting" | "vote" => Ok(GenerationStrategy::Voting),
            "single" | "single_shot" => Ok(GenerationStrategy::SingleShot),
            other => Err(QueryError::Configuration(format!(
                "unknown SQL generation strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub base_url: String,
    pub api_key: String,
    /// Model name (OpenAI) or deployment name (Azure).
    pub model: String,
    pub api_version: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub llm: LlmSettings,
    pub db_connect_timeout: Duration,
    pub db_query_timeout: Duration,
    pub schema_index_ttl: Duration,
    pub clarification_ttl: chrono::Duration,
    pub intent_confidence_threshold: f64,
    pub max_row_limit: u32,
    pub generation_strategy: GenerationStrategy,
    pub audit_database_url: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            api_version: "2025-01-01-preview".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            db_connect_timeout: Duration::from_secs(10),
            db_query_timeout: Duration::from_secs(30),
            schema_index_ttl: Duration::from_secs(300),
            clarification_ttl: chrono::Duration::minutes(10),
            intent_confidence_threshold: 0.7,
            max_row_limit: 1000,
            generation_strategy: GenerationStrategy::Voting,
            audit_database_url: None,
        }
    }
}

impl Settings {
    /// Read settings from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`] but with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let llm = LlmSettings {
            provider: match get("LLM_PROVIDER") {
                Some(v) => v.parse()?,
                None => defaults.llm.provider,
            },
            base_url: get("LLM_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.llm.base_url),
            api_key: get("LLM_API_KEY").unwrap_or(defaults.llm.api_key),
            model: get("LLM_MODEL").unwrap_or(defaults.llm.model),
            api_version: get("LLM_API_VERSION").unwrap_or(defaults.llm.api_version),
            connect_timeout: secs(&get, "LLM_CONNECT_TIMEOUT_SECS", defaults.llm.connect_timeout)?,
            request_timeout: secs(&get, "LLM_REQUEST_TIMEOUT_SECS", defaults.llm.request_timeout)?,
            max_attempts: parse_or(&get, "LLM_MAX_ATTEMPTS", defaults.llm.max_attempts)?,
            backoff_base: Duration::from_millis(parse_or(
                &get,
                "LLM_BACKOFF_BASE_MS",
                defaults.llm.backoff_base.as_millis() as u64,
            )?),
            cache_ttl: secs(&get, "LLM_CACHE_TTL_SECS", defaults.llm.cache_ttl)?,
        };

        let settings = Settings {
            llm,
            db_connect_timeout: secs(&get, "DB_CONNECT_TIMEOUT_SECS", defaults.db_connect_timeout)?,
            db_query_timeout: secs(&get, "DB_QUERY_TIMEOUT_SECS", defaults.db_query_timeout)?,
            schema_index_ttl: secs(&get, "SCHEMA_INDEX_TTL_SECS", defaults.schema_index_ttl)?,
            clarification_ttl: chrono::Duration::minutes(parse_or(
                &get,
                "CLARIFICATION_TTL_MINUTES",
                defaults.clarification_ttl.num_minutes(),
            )?),
            intent_confidence_threshold: parse_or(
                &get,
                "INTENT_CONFIDENCE_THRESHOLD",
                defaults.intent_confidence_threshold,
            )?,
            max_row_limit: parse_or(&get, "MAX_ROW_LIMIT", defaults.max_row_limit)?,
            generation_strategy: match get("SQL_GENERATION_STRATEGY") {
                Some(v) => v.parse()?,
                None => defaults.generation_strategy,
            },
            audit_database_url: get("AUDIT_DATABASE_URL"),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.intent_confidence_threshold) {
            return Err(QueryError::Configuration(format!(
                "INTENT_CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                self.intent_confidence_threshold
            )));
        }
        if self.llm.max_attempts == 0 {
            return Err(QueryError::Configuration("LLM_MAX_ATTEMPTS must be at least 1".into()));
        }
        if self.max_row_limit == 0 {
            return Err(QueryError::Configuration("MAX_ROW_LIMIT must be at least 1".into()));
        }
        if self.clarification_ttl <= chrono::Duration::zero() {
            return Err(QueryError::Configuration(
                "CLARIFICATION_TTL_MINUTES must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| QueryError::Configuration(format!("{}='{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

fn secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}
