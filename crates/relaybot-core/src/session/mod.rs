//! Short-lived conversation sessions.
//!
//! A session holds the recent messages of one conversation plus a free-form
//! context map. Sessions expire after a TTL that is refreshed on every
//! read, and only the most recent `max_messages` messages are retained.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::provider::types::{ChatMessage, Role};

/// A single message in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// A conversation session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<SessionMessage>,
    pub context: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id,
            messages: Vec::new(),
            context: Map::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now().to_rfc3339();
    }

    /// The last `window` user/assistant messages, ready for a completion call.
    pub fn history(&self, window: usize) -> Vec<ChatMessage> {
        let turns: Vec<&SessionMessage> = self
            .messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .collect();
        let start = turns.len().saturating_sub(window);

        turns[start..]
            .iter()
            .map(|m| match m.role {
                Role::User => ChatMessage::user(&m.content),
                _ => ChatMessage::assistant(&m.content),
            })
            .collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Storage for conversation sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create an empty session and return its id.
    async fn create(&self) -> String;

    /// Fetch a live session, refreshing its TTL.
    async fn get(&self, id: &str) -> Option<Session>;

    /// Append a message, dropping the oldest beyond the retention cap.
    async fn append_message(
        &self,
        id: &str,
        role: Role,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), SessionError>;

    /// The most recent `limit` messages (all of them when `limit` is 0).
    async fn get_messages(&self, id: &str, limit: usize) -> Result<Vec<SessionMessage>, SessionError>;

    /// Merge `context` into the session's context map.
    async fn update_context(&self, id: &str, context: Map<String, Value>) -> Result<(), SessionError>;

    async fn delete(&self, id: &str) -> bool;
}

struct Entry {
    session: Session,
    expires_at: Instant,
}

/// In-process session store.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
    max_messages: usize,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration, max_messages: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            max_messages: max_messages.max(1),
        }
    }

    /// Drop every expired session. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, e| e.expires_at > now);
        before - sessions.len()
    }

    /// Recreate a session under a known id, seeded with earlier turns.
    ///
    /// Replaces any live session with the same id.
    pub async fn resume(&self, id: &str, turns: Vec<(Role, String)>) {
        let mut session = Session::new(id.to_string());
        let stamp = session.created_at.clone();
        let skip = turns.len().saturating_sub(self.max_messages);
        session.messages = turns
            .into_iter()
            .skip(skip)
            .map(|(role, content)| SessionMessage {
                role,
                content,
                timestamp: stamp.clone(),
                metadata: Map::new(),
            })
            .collect();

        let entry = Entry {
            session,
            expires_at: Instant::now() + self.ttl,
        };
        self.sessions.write().await.insert(id.to_string(), entry);
        debug!(session = id, "Resumed session");
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Run `f` on a live session, refreshing its TTL; expired entries are purged.
    async fn with_live<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> T) -> Result<T, SessionError> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + self.ttl;
                Ok(f(&mut entry.session))
            }
            Some(_) => {
                debug!(session = id, "Session expired");
                sessions.remove(id);
                Err(SessionError::NotFound(id.to_string()))
            }
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self) -> String {
        let purged = self.purge_expired().await;
        if purged > 0 {
            debug!(purged, "Purged expired sessions");
        }

        let id = Uuid::new_v4().to_string();
        let entry = Entry {
            session: Session::new(id.clone()),
            expires_at: Instant::now() + self.ttl,
        };
        self.sessions.write().await.insert(id.clone(), entry);
        debug!(session = %id, "Created session");
        id
    }

    async fn get(&self, id: &str) -> Option<Session> {
        self.with_live(id, |s| s.clone()).await.ok()
    }

    async fn append_message(
        &self,
        id: &str,
        role: Role,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), SessionError> {
        let cap = self.max_messages;
        self.with_live(id, |session| {
            session.messages.push(SessionMessage {
                role,
                content: content.to_string(),
                timestamp: Utc::now().to_rfc3339(),
                metadata,
            });
            let excess = session.messages.len().saturating_sub(cap);
            session.messages.drain(..excess);
            session.touch();
        })
        .await
    }

    async fn get_messages(&self, id: &str, limit: usize) -> Result<Vec<SessionMessage>, SessionError> {
        self.with_live(id, |session| {
            let start = if limit == 0 {
                0
            } else {
                session.messages.len().saturating_sub(limit)
            };
            session.messages[start..].to_vec()
        })
        .await
    }

    async fn update_context(&self, id: &str, context: Map<String, Value>) -> Result<(), SessionError> {
        self.with_live(id, |session| {
            session.context.extend(context);
            session.touch();
        })
        .await
    }

    async fn delete(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemorySessionStore {
        MemorySessionStore::new(Duration::from_secs(3600), 20)
    }

    #[tokio::test]
    async fn test_create_and_append() {
        let store = store();
        let id = store.create().await;
        store.append_message(&id, Role::User, "hello", Map::new()).await.unwrap();
        store.append_message(&id, Role::Assistant, "hi!", Map::new()).await.unwrap();

        let session = store.get(&id).await.unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].content, "hi!");
    }

    #[tokio::test]
    async fn test_retention_cap_keeps_latest() {
        let store = MemorySessionStore::new(Duration::from_secs(60), 20);
        let id = store.create().await;
        for i in 0..25 {
            store
                .append_message(&id, Role::User, &format!("msg {}", i), Map::new())
                .await
                .unwrap();
        }
        let messages = store.get_messages(&id, 0).await.unwrap();
        assert_eq!(messages.len(), 20);
        assert_eq!(messages[0].content, "msg 5");
        assert_eq!(messages[19].content, "msg 24");

        let recent = store.get_messages(&id, 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 22", "msg 23", "msg 24"]);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = store();
        assert!(store.get("missing").await.is_none());
        assert_eq!(
            store.append_message("missing", Role::User, "x", Map::new()).await,
            Err(SessionError::NotFound("missing".into()))
        );
    }

    #[tokio::test]
    async fn test_expired_session_is_absent() {
        let store = MemorySessionStore::new(Duration::from_millis(30), 20);
        let id = store.create().await;
        assert!(store.get(&id).await.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get(&id).await.is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_reads_refresh_ttl() {
        let store = MemorySessionStore::new(Duration::from_millis(150), 20);
        let id = store.create().await;
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(store.get(&id).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_context_merges() {
        let store = store();
        let id = store.create().await;
        let mut first = Map::new();
        first.insert("lang".into(), json!("ko"));
        first.insert("topic".into(), json!("weather"));
        store.update_context(&id, first).await.unwrap();
        let mut second = Map::new();
        second.insert("topic".into(), json!("math"));
        store.update_context(&id, second).await.unwrap();

        let session = store.get(&id).await.unwrap();
        assert_eq!(session.context["lang"], "ko");
        assert_eq!(session.context["topic"], "math");
    }

    #[tokio::test]
    async fn test_history_window_skips_tool_and_system() {
        let store = store();
        let id = store.create().await;
        store.append_message(&id, Role::System, "sys", Map::new()).await.unwrap();
        for (role, text) in [
            (Role::User, "q1"),
            (Role::Assistant, "a1"),
            (Role::Tool, "{}"),
            (Role::User, "q2"),
            (Role::Assistant, "a2"),
        ] {
            store.append_message(&id, role, text, Map::new()).await.unwrap();
        }

        let history = store.get(&id).await.unwrap().history(3);
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a1", "q2", "a2"]);
        assert_eq!(history[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_resume_seeds_known_id() {
        let store = MemorySessionStore::new(Duration::from_secs(60), 3);
        let turns = vec![
            (Role::User, "q1".to_string()),
            (Role::Assistant, "a1".to_string()),
            (Role::User, "q2".to_string()),
            (Role::Assistant, "a2".to_string()),
        ];
        store.resume("saved-session", turns).await;

        let session = store.get("saved-session").await.unwrap();
        let contents: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a1", "q2", "a2"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store();
        let id = store.create().await;
        assert!(store.delete(&id).await);
        assert!(!store.delete(&id).await);
        assert!(store.get(&id).await.is_none());
    }
}
