//! Clarification sessions
//!
//! A session links a disambiguation exchange back to the original question.
//! Sessions are single use: consumption is an atomic remove, so two requests
//! racing on the same id cannot both be served.

use crate::error::{QueryError, Result};
use crate::intent::IntentAnalysis;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationSession {
    pub id: String,
    pub org_id: String,
    pub user_id: String,
    pub original_question: String,
    pub schema_name: String,
    pub intent_analysis: IntentAnalysis,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ClarificationSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub org_id: String,
    pub user_id: String,
    pub original_question: String,
    pub schema_name: String,
    pub intent_analysis: IntentAnalysis,
}

#[async_trait]
pub trait ClarificationStore: Send + Sync {
    async fn create(&self, session: NewSession) -> Result<ClarificationSession>;

    /// Fetch a live session. Expired sessions are removed and reported as
    /// [`QueryError::SessionExpired`].
    async fn get(&self, id: &str) -> Result<ClarificationSession>;

    /// Remove a session. Returns `false` when it was already gone.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn purge_expired(&self) -> Result<usize>;
}

/// Expired sessions are swept once per this many creations.
const PURGE_EVERY: usize = 64;

pub struct InMemoryClarificationStore {
    sessions: DashMap<String, ClarificationSession>,
    ttl: Duration,
    created: AtomicUsize,
}

impl InMemoryClarificationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            created: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl ClarificationStore for InMemoryClarificationStore {
    async fn create(&self, session: NewSession) -> Result<ClarificationSession> {
        let now = Utc::now();
        let record = ClarificationSession {
            id: Uuid::new_v4().to_string(),
            org_id: session.org_id,
            user_id: session.user_id,
            original_question: session.original_question,
            schema_name: session.schema_name,
            intent_analysis: session.intent_analysis,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.sessions.insert(record.id.clone(), record.clone());
        if (self.created.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY == 0 {
            let removed = self.purge_expired().await?;
            debug!(removed, remaining = self.sessions.len(), "clarification sessions swept");
        }
        info!(
            clarification_id = %record.id,
            org_id = %record.org_id,
            expires_at = %record.expires_at,
            "clarification session created"
        );
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<ClarificationSession> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(QueryError::SessionNotFound)?;

        if session.is_expired_at(Utc::now()) {
            self.sessions.remove(id);
            debug!(clarification_id = id, "expired clarification session removed");
            return Err(QueryError::SessionExpired);
        }
        Ok(session)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.remove(id).is_some())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired_at(now));
        Ok(before.saturating_sub(self.sessions.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> NewSession {
        NewSession {
            org_id: "acme".into(),
            user_id: "u1".into(),
            original_question: "show sales".into(),
            schema_name: "sales".into(),
            intent_analysis: IntentAnalysis::default(),
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = InMemoryClarificationStore::new(Duration::minutes(10));
        let session = store.create(new_session()).await.unwrap();
        assert!(Uuid::parse_str(&session.id).is_ok());
        assert_eq!(session.expires_at - session.created_at, Duration::minutes(10));

        let fetched = store.get(&session.id).await.unwrap();
        assert_eq!(fetched.original_question, "show sales");

        assert!(store.delete(&session.id).await.unwrap());
        assert!(!store.delete(&session.id).await.unwrap());
        assert!(matches!(store.get(&session.id).await, Err(QueryError::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_expired_session_is_removed_on_get() {
        let store = InMemoryClarificationStore::new(Duration::minutes(-1));
        let session = store.create(new_session()).await.unwrap();
        assert_eq!(store.len(), 1);

        assert!(matches!(store.get(&session.id).await, Err(QueryError::SessionExpired)));
        assert!(store.is_empty());
        assert!(matches!(store.get(&session.id).await, Err(QueryError::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryClarificationStore::new(Duration::seconds(-5));
        store.create(new_session()).await.unwrap();
        store.create(new_session()).await.unwrap();
        assert_eq!(store.purge_expired().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_creation_sweeps_expired_sessions() {
        let store = InMemoryClarificationStore::new(Duration::seconds(-5));
        for _ in 0..PURGE_EVERY - 1 {
            store.create(new_session()).await.unwrap();
        }
        assert_eq!(store.len(), PURGE_EVERY - 1);
        store.create(new_session()).await.unwrap();
        assert!(store.is_empty());
    }
}
