//! Persistence seams the relay depends on.
//!
//! Sessions and chat messages belong to the surrounding system; the relay only
//! needs "look up a session" and "append / list messages". In-memory
//! implementations back local runs and tests, and sessions can also be read
//! from Redis where the web tier writes them.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use order_chat_core::{ChatMessage, SessionRecord};
use parking_lot::RwLock;
use redis::{aio::ConnectionManager, AsyncCommands};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn lookup(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists a message. The record is returned unchanged for publishing.
    async fn append(&self, message: ChatMessage) -> Result<ChatMessage, StoreError>;

    /// All messages of an order, oldest first.
    async fn list(&self, order_id: &str) -> Result<Vec<ChatMessage>, StoreError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: SessionRecord) {
        self.sessions
            .write()
            .insert(session.session_id.clone(), session);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn lookup(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.read().get(session_id).cloned())
    }
}

/// Sessions stored as JSON under `session:<id>`.
#[derive(Clone)]
pub struct RedisSessionStore {
    redis: ConnectionManager,
}

impl RedisSessionStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn key(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    /// Writes a session with a TTL matching its expiry.
    pub async fn insert(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let ttl = (session.expires_at - OffsetDateTime::now_utc())
            .whole_seconds()
            .max(1) as u64;
        let payload = serde_json::to_string(session)?;
        conn.set_ex::<_, _, ()>(Self::key(&session.session_id), payload, ttl)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn lookup(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let payload: Option<String> = conn.get(Self::key(session_id)).await?;
        match payload {
            Some(serialized) => Ok(Some(serde_json::from_str(&serialized)?)),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut guard = self.messages.write();
        let thread = guard.entry(message.order_id.clone()).or_default();
        thread.push(message.clone());
        thread.sort_by_key(|msg| msg.created_at);
        Ok(message)
    }

    async fn list(&self, order_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .messages
            .read()
            .get(order_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub type SharedSessionStore = Arc<dyn SessionStore>;
pub type SharedMessageStore = Arc<dyn MessageStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use order_chat_core::{SenderType, DEFAULT_SESSION_TTL};

    #[test_timeout::tokio_timeout_test]
    async fn memory_sessions_round_trip() {
        let store = MemorySessionStore::new();
        let session = SessionRecord::issue("user-1", DEFAULT_SESSION_TTL).with_id("sess-1");
        store.insert(session.clone());

        assert_eq!(store.lookup("sess-1").await.unwrap(), Some(session));
        assert_eq!(store.lookup("sess-unknown").await.unwrap(), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn messages_are_listed_per_order_oldest_first() {
        let store = MemoryMessageStore::new();
        let mut late = ChatMessage::new("order-1", SenderType::Staff, "second");
        let mut early = ChatMessage::new("order-1", SenderType::Customer, "first");
        early.created_at = late.created_at - time::Duration::seconds(5);
        late.id = "late".into();
        early.id = "early".into();

        store.append(late).await.unwrap();
        store.append(early).await.unwrap();
        store
            .append(ChatMessage::new("order-2", SenderType::Staff, "elsewhere"))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list("order-1")
            .await
            .unwrap()
            .into_iter()
            .map(|msg| msg.id)
            .collect();
        assert_eq!(ids, vec!["early".to_string(), "late".to_string()]);
        assert!(store.list("order-3").await.unwrap().is_empty());
    }
}
