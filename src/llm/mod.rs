//! LLM integration
//!
//! Chat-completions transport, response cache, prompt catalogue and the
//! parsers that turn free-form completions into SQL or JSON.

pub mod cache;
pub mod classifier;
pub mod client;
pub mod parsers;
pub mod prompts;

pub use cache::LlmResponseCache;
pub use classifier::{LlmClassifier, NlClassifier};
pub use client::{LlmClient, RetryPolicy};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}
