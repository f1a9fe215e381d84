//! Chat-completions client
//!
//! Speaks the OpenAI wire format, either against an OpenAI-compatible base
//! URL or an Azure deployment. Transient failures are retried with
//! exponential backoff; 4xx answers other than 429 fail immediately.

use crate::config::{LlmProvider, LlmSettings};
use crate::error::{ClassifierError, QueryError};
use crate::llm::cache::LlmResponseCache;
use crate::llm::ChatMessage;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_delay.as_millis() as f64)
            * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

pub struct LlmClient {
    http: reqwest::Client,
    settings: LlmSettings,
    retry: RetryPolicy,
    cache: Option<Arc<LlmResponseCache>>,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self, QueryError> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| QueryError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        let retry = RetryPolicy {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: settings.backoff_base,
            ..RetryPolicy::default()
        };
        Ok(Self {
            http,
            settings,
            retry,
            cache: None,
        })
    }

    pub fn with_cache(mut self, cache: Arc<LlmResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<String, ClassifierError> {
        let cache_key = self
            .cache
            .as_ref()
            .map(|_| LlmResponseCache::key(&self.settings.model, messages, temperature, max_tokens));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(hit) = cache.get(key) {
                debug!(temperature, "completion served from cache");
                return Ok(hit);
            }
        }

        let mut attempt = 0;
        loop {
            match self.send_once(messages, temperature, max_tokens).await {
                Ok(content) => {
                    if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                        cache.insert(key.clone(), content.clone());
                    }
                    return Ok(content);
                }
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LLM call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn endpoint(&self) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        match self.settings.provider {
            LlmProvider::OpenAi => format!("{}/chat/completions", base),
            LlmProvider::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base, self.settings.model, self.settings.api_version
            ),
        }
    }

    async fn send_once(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<String, ClassifierError> {
        let mut body = json!({
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        let request = match self.settings.provider {
            LlmProvider::OpenAi => {
                body["model"] = Value::String(self.settings.model.clone());
                self.http
                    .post(self.endpoint())
                    .bearer_auth(&self.settings.api_key)
            }
            LlmProvider::Azure => self
                .http
                .post(self.endpoint())
                .header("api-key", &self.settings.api_key),
        };

        let response = request.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                ClassifierError::Timeout
            } else {
                ClassifierError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ClassifierError::Malformed(format!("invalid JSON body: {}", e)))?;
        extract_content(&payload)
    }
}

fn extract_content(payload: &Value) -> Result<String, ClassifierError> {
    let choice = &payload["choices"][0];
    if choice["finish_reason"].as_str() == Some("content_filter") {
        return Err(ClassifierError::Malformed(
            "completion blocked by content filter".to_string(),
        ));
    }
    match choice["message"]["content"].as_str() {
        Some(content) if !content.trim().is_empty() => Ok(content.to_string()),
        _ => Err(ClassifierError::Malformed("no content in completion".to_string())),
    }
}
