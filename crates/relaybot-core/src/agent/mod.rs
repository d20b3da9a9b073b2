//! Chat orchestration: the glue between sessions, the fallback engine and
//! the transcript store.
//!
//! For every user message the orchestrator:
//! 1. Appends the message to the session
//! 2. Builds the conversation (system prompt + recent session window)
//! 3. Runs a fallback round on the engine
//! 4. Persists the answer to the session and the history store
//!
//! Fatal engine errors are returned to the caller and nothing is written
//! as an assistant message.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{CompletionResult, EngineError, FallbackEngine, StreamEvent};
use crate::history::{HistoryRecord, HistoryStore, ToolUse};
use crate::provider::types::{ChatMessage, Role, Usage};
use crate::session::{SessionError, SessionStore};
use crate::tools::ToolInvocation;

const EVENT_BUFFER: usize = 64;

/// Orchestrator settings, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub system_prompt: String,
    /// Recent user/assistant messages fed into each completion.
    pub history_window: usize,
    pub free_only: bool,
    /// Persist on a spawned task instead of before replying.
    pub background_writes: bool,
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.completion.system_prompt.clone(),
            history_window: config.session.history_window,
            free_only: config.completion.free_only,
            background_writes: config.history.background_writes,
        }
    }
}

/// The settled answer to one user message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub tools_used: Vec<ToolUse>,
    pub session_id: String,
    pub model_used: String,
    pub usage: Usage,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl AgentError {
    /// Stable machine-readable tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::Engine(e) => e.kind(),
            Self::Storage(_) => "storage_error",
        }
    }
}

impl From<SessionError> for AgentError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => Self::SessionNotFound(id),
        }
    }
}

/// Sessions + engine + history. Cheap to clone.
#[derive(Clone)]
pub struct ChatOrchestrator {
    engine: FallbackEngine,
    sessions: Arc<dyn SessionStore>,
    history: Arc<dyn HistoryStore>,
    config: OrchestratorConfig,
}

impl ChatOrchestrator {
    pub fn new(
        engine: FallbackEngine,
        sessions: Arc<dyn SessionStore>,
        history: Arc<dyn HistoryStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            engine,
            sessions,
            history,
            config,
        }
    }

    pub fn engine(&self) -> &FallbackEngine {
        &self.engine
    }

    pub async fn create_session(&self) -> String {
        self.sessions.create().await
    }

    /// Reuse a live session, or start a fresh one for unknown or expired ids.
    pub async fn ensure_session(&self, session_id: Option<&str>) -> String {
        if let Some(id) = session_id {
            if self.sessions.get(id).await.is_some() {
                return id.to_string();
            }
            debug!(session = id, "Unknown or expired session, creating a new one");
        }
        self.sessions.create().await
    }

    /// Process one user message and return the settled answer.
    pub async fn process(&self, session_id: &str, message: &str, use_tools: bool) -> Result<ChatReply, AgentError> {
        info!(session = session_id, use_tools, "Processing user message");
        let conversation = self.prepare(session_id, message).await?;

        let result = self
            .engine
            .complete(&conversation, use_tools, self.config.free_only)
            .await?;

        let reply = ChatReply {
            response: result.content.clone(),
            tools_used: result.tool_invocations.iter().map(ToolUse::from).collect(),
            session_id: session_id.to_string(),
            model_used: result.model_used.clone(),
            usage: result.usage,
        };
        self.persist(session_id, message, result).await;
        Ok(reply)
    }

    /// Process one user message as a stream of events.
    ///
    /// The answer is persisted once the `Done` event has been relayed.
    pub async fn process_stream(
        &self,
        session_id: &str,
        message: &str,
        use_tools: bool,
    ) -> Result<mpsc::Receiver<StreamEvent>, AgentError> {
        info!(session = session_id, use_tools, "Processing user message (stream)");
        let conversation = self.prepare(session_id, message).await?;

        let mut events = self
            .engine
            .stream_complete(conversation, use_tools, self.config.free_only);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = self.clone();
        let session_id = session_id.to_string();
        let message = message.to_string();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let settled = match &event {
                    StreamEvent::Done {
                        model_used,
                        content,
                        usage,
                        tool_invocations,
                    } => Some(CompletionResult {
                        content: content.clone(),
                        tool_invocations: tool_invocations.clone(),
                        model_used: model_used.clone(),
                        usage: *usage,
                    }),
                    _ => None,
                };
                let delivered = tx.send(event).await.is_ok();

                if let Some(result) = settled {
                    this.persist(&session_id, &message, result).await;
                    break;
                }
                if !delivered {
                    debug!(session = %session_id, "Stream consumer went away");
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Transcript records for a live session, oldest first.
    pub async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryRecord>, AgentError> {
        if self.sessions.get(session_id).await.is_none() {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }
        Ok(self.history.query(session_id, limit).await?)
    }

    /// Record the user turn and build the conversation for the engine.
    async fn prepare(&self, session_id: &str, message: &str) -> Result<Vec<ChatMessage>, AgentError> {
        self.sessions
            .append_message(session_id, Role::User, message, Map::new())
            .await?;
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;

        let mut conversation = vec![ChatMessage::system(&self.config.system_prompt)];
        conversation.extend(session.history(self.config.history_window));
        debug!(session = session_id, messages = conversation.len(), "Conversation built");
        Ok(conversation)
    }

    async fn persist(&self, session_id: &str, user_message: &str, result: CompletionResult) {
        let sessions = Arc::clone(&self.sessions);
        let history = Arc::clone(&self.history);
        let session_id = session_id.to_string();
        let user_message = user_message.to_string();

        let write = async move {
            write_exchange(sessions.as_ref(), history.as_ref(), &session_id, &user_message, &result).await
        };
        if self.config.background_writes {
            tokio::spawn(write);
        } else {
            write.await;
        }
    }
}

/// Failures are logged, never surfaced: the caller already has its answer.
async fn write_exchange(
    sessions: &dyn SessionStore,
    history: &dyn HistoryStore,
    session_id: &str,
    user_message: &str,
    result: &CompletionResult,
) {
    let tools_used: Vec<ToolUse> = result.tool_invocations.iter().map(ToolUse::from).collect();

    let mut metadata = Map::new();
    metadata.insert("model_used".into(), json!(result.model_used));
    metadata.insert("usage".into(), json!(result.usage));
    if !result.tool_invocations.is_empty() {
        metadata.insert("tools_used".into(), tool_names(&result.tool_invocations));
    }

    if let Err(e) = sessions
        .append_message(session_id, Role::Assistant, &result.content, metadata.clone())
        .await
    {
        warn!(session = session_id, error = %e, "Failed to save assistant message");
    }

    let mut context = Map::new();
    context.insert("last_model".into(), json!(result.model_used));
    if let Err(e) = sessions.update_context(session_id, context).await {
        warn!(session = session_id, error = %e, "Failed to update session context");
    }

    let record = HistoryRecord::new(
        session_id,
        user_message,
        &result.content,
        tools_used,
        &result.model_used,
        result.usage,
    )
    .with_metadata(metadata);
    if let Err(e) = history.append(record).await {
        warn!(session = session_id, error = %e, "Failed to write chat history");
    }
}

fn tool_names(invocations: &[ToolInvocation]) -> Value {
    Value::Array(invocations.iter().map(|i| json!(i.tool_name)).collect())
}
