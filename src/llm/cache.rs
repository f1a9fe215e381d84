//! In-process cache of chat completions keyed by request content.

use crate::llm::ChatMessage;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Expired entries are swept once per this many inserts.
const PURGE_EVERY: usize = 64;

pub struct LlmResponseCache {
    entries: DashMap<String, (Instant, String)>,
    ttl: Duration,
    inserts: AtomicUsize,
}

impl LlmResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            inserts: AtomicUsize::new(0),
        }
    }

    pub fn key(model: &str, messages: &[ChatMessage], temperature: f64, max_tokens: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        for message in messages {
            hasher.update(message.role.as_bytes());
            hasher.update([0u8]);
            hasher.update(message.content.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(temperature.to_bits().to_le_bytes());
        hasher.update(max_tokens.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let (stored_at, content) = entry.value();
                if stored_at.elapsed() < self.ttl {
                    return Some(content.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: String, content: String) {
        self.entries.insert(key, (Instant::now(), content));
        if (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY == 0 {
            let removed = self.purge_expired();
            debug!(removed, remaining = self.entries.len(), "LLM response cache swept");
        }
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
