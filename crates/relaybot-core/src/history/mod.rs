//! Durable chat transcripts.
//!
//! Each session gets its own JSONL file; every line is one exchange
//! (user message, final assistant answer, tools used, model, usage).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::provider::types::Usage;
use crate::tools::ToolInvocation;

/// One tool call as recorded in history and returned to API callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub tool: String,
    pub args: Value,
    pub result: Value,
}

impl From<&ToolInvocation> for ToolUse {
    fn from(invocation: &ToolInvocation) -> Self {
        Self {
            tool: invocation.tool_name.clone(),
            args: invocation.arguments.clone(),
            result: invocation.result.clone(),
        }
    }
}

/// A persisted user/assistant exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    pub session_id: String,
    pub user_message: String,
    pub assistant_message: String,
    #[serde(default)]
    pub tools_used: Vec<ToolUse>,
    pub model_used: String,
    #[serde(default)]
    pub usage: Usage,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl HistoryRecord {
    pub fn new(
        session_id: &str,
        user_message: &str,
        assistant_message: &str,
        tools_used: Vec<ToolUse>,
        model_used: &str,
        usage: Usage,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_message: user_message.to_string(),
            assistant_message: assistant_message.to_string(),
            tools_used,
            model_used: model_used.to_string(),
            usage,
            created_at: Utc::now().to_rfc3339(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Append-only transcript storage keyed by session id.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: HistoryRecord) -> Result<()>;

    /// The most recent `limit` records for a session, oldest first.
    async fn query(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryRecord>>;
}

/// JSONL files under a history directory, one per session.
pub struct JsonlHistoryStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlHistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        let safe_name: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.jsonl", safe_name))
    }
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, record: HistoryRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let path = self.session_path(&record.session_id);

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating history dir {}", self.dir.display()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(session = %record.session_id, id = %record.id, "History record appended");
        Ok(())
    }

    async fn query(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryRecord>> {
        let path = self.session_path(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        let mut records = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(session = session_id, error = %e, "Skipping unparsable history line"),
            }
        }

        let start = records.len().saturating_sub(limit);
        Ok(records.split_off(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> JsonlHistoryStore {
        let dir = std::env::temp_dir().join(format!("relaybot-history-{}", Uuid::new_v4()));
        JsonlHistoryStore::new(dir)
    }

    fn record(session: &str, n: usize) -> HistoryRecord {
        HistoryRecord::new(
            session,
            &format!("question {}", n),
            &format!("answer {}", n),
            Vec::new(),
            "model-a",
            Usage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            },
        )
    }

    #[tokio::test]
    async fn test_append_and_query_chronological() {
        let store = temp_store();
        for n in 0..5 {
            store.append(record("s1", n)).await.unwrap();
        }

        let recent = store.query("s1", 3).await.unwrap();
        let users: Vec<&str> = recent.iter().map(|r| r.user_message.as_str()).collect();
        assert_eq!(users, vec!["question 2", "question 3", "question 4"]);
        assert_eq!(recent[0].usage.total_tokens, 5);

        let all = store.query("s1", 50).await.unwrap();
        assert_eq!(all.len(), 5);

        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = temp_store();
        store.append(record("s1", 0)).await.unwrap();
        store.append(record("s2", 1)).await.unwrap();

        assert_eq!(store.query("s1", 10).await.unwrap().len(), 1);
        assert_eq!(store.query("s2", 10).await.unwrap()[0].assistant_message, "answer 1");
        assert!(store.query("s3", 10).await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn test_unparsable_lines_are_skipped() {
        let store = temp_store();
        store.append(record("s1", 0)).await.unwrap();
        let path = store.session_path("s1");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n\n");
        std::fs::write(&path, content).unwrap();
        store.append(record("s1", 1)).await.unwrap();

        let records = store.query("s1", 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].user_message, "question 1");

        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[tokio::test]
    async fn test_tools_used_round_trip_through_file() {
        let store = temp_store();
        let uses = vec![ToolUse {
            tool: "calculator".into(),
            args: json!({"expression": "2+2"}),
            result: json!({"success": true, "result": 4}),
        }];
        let mut meta = Map::new();
        meta.insert("source".into(), json!("cli"));
        let rec = HistoryRecord::new("s1", "2+2?", "4", uses.clone(), "model-b", Usage::default())
            .with_metadata(meta);
        store.append(rec.clone()).await.unwrap();

        let loaded = store.query("s1", 1).await.unwrap();
        assert_eq!(loaded, vec![rec]);

        let _ = std::fs::remove_dir_all(store.dir());
    }

    #[test]
    fn test_session_path_is_sanitized() {
        let store = JsonlHistoryStore::new("/tmp/h");
        assert_eq!(store.session_path("../etc/passwd"), PathBuf::from("/tmp/h/___etc_passwd.jsonl"));
    }
}
