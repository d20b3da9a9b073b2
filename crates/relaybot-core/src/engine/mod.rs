//! Fallback completion engine.
//!
//! One user message becomes one *fallback round*: candidates from the
//! [`ModelCatalog`] are tried strictly one after another in priority order
//! until one produces an answer. Rate limits and generic failures move on
//! to the next candidate; an authentication failure ends the round, since
//! no other model can succeed with the same credential.
//!
//! When the answering model asks for tools, they are executed once, their
//! results are appended to the conversation, and a single follow-up call to
//! the same model (without tool schemas) produces the final answer.
//!
//! The round is an explicit state machine:
//!
//! ```text
//! Selecting ─► Calling(i) ─► Done
//!                 │  ▲
//!                 │  └──────────────┐ (retryable error: i + 1)
//!                 ▼                 │
//!           ToolExecuting ─► FollowupCalling ─► Done
//!
//! Selecting (no candidates) / Calling (auth error, candidates exhausted) ─► Failed
//! ```

pub mod stream;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{ModelCatalog, ModelDescriptor};
use crate::provider::types::{ChatMessage, LlmResponse, ToolDefinition, Usage};
use crate::provider::{ErrorKind, LlmProvider, ProviderError};
use crate::tools::{ToolInvocation, ToolRegistry};

pub use stream::StreamEvent;

/// Per-request completion parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Bound on each vendor call; expiry is a retryable failure.
    pub call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// The single answer produced for one user message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionResult {
    pub content: String,
    pub tool_invocations: Vec<ToolInvocation>,
    pub model_used: String,
    /// Summed over every vendor call that contributed to this answer.
    pub usage: Usage,
}

/// Fatal outcome of a fallback round.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("no available model (require_tools={require_tools}, free_only={free_only})")]
    NoAvailableModel { require_tools: bool, free_only: bool },

    #[error("authentication failed on {model}: {source}")]
    AuthFailure {
        model: String,
        #[source]
        source: ProviderError,
    },

    #[error("all {attempts} candidate model(s) failed, last error: {last_error}")]
    AllModelsFailed {
        attempts: usize,
        last_error: ProviderError,
    },
}

impl EngineError {
    /// Stable machine-readable tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoAvailableModel { .. } => "no_available_model",
            Self::AuthFailure { .. } => "auth_failure",
            Self::AllModelsFailed { .. } => "all_models_failed",
        }
    }
}

enum State {
    Selecting,
    Calling {
        index: usize,
    },
    ToolExecuting {
        index: usize,
        response: LlmResponse,
    },
    FollowupCalling {
        index: usize,
        conversation: Vec<ChatMessage>,
        invocations: Vec<ToolInvocation>,
        usage: Usage,
    },
    Done(CompletionResult),
    Failed(EngineError),
}

/// Fallback engine. Cheap to clone; all state lives behind `Arc`s.
#[derive(Clone)]
pub struct FallbackEngine {
    provider: Arc<dyn LlmProvider>,
    catalog: Arc<ModelCatalog>,
    tools: Arc<ToolRegistry>,
    config: EngineConfig,
}

impl FallbackEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        catalog: Arc<ModelCatalog>,
        tools: Arc<ToolRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            catalog,
            tools,
            config,
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    fn tool_schemas(&self, require_tools: bool) -> Vec<ToolDefinition> {
        if require_tools {
            self.tools.describe_all()
        } else {
            Vec::new()
        }
    }

    /// Produce one answer for `conversation`, falling back across models.
    ///
    /// Intermediate attempts are only logged; the caller sees either the
    /// final answer or a fatal error.
    pub async fn complete(
        &self,
        conversation: &[ChatMessage],
        require_tools: bool,
        free_only: bool,
    ) -> Result<CompletionResult, EngineError> {
        let tools = self.tool_schemas(require_tools);
        let mut candidates: Vec<ModelDescriptor> = Vec::new();
        let mut last_error: Option<ProviderError> = None;
        let mut state = State::Selecting;

        loop {
            state = match state {
                State::Selecting => {
                    candidates = self.catalog.list_candidates(require_tools, free_only);
                    debug!(
                        require_tools,
                        free_only,
                        candidates = candidates.len(),
                        "Selected candidate models"
                    );
                    if candidates.is_empty() {
                        State::Failed(EngineError::NoAvailableModel {
                            require_tools,
                            free_only,
                        })
                    } else {
                        State::Calling { index: 0 }
                    }
                }

                State::Calling { index } => match candidates.get(index) {
                    None => State::Failed(exhausted(candidates.len(), last_error.take(), require_tools, free_only)),
                    Some(model) => {
                        info!(model = %model.id, attempt = index + 1, of = candidates.len(), "Trying model");
                        match self.call(&model.id, conversation, &tools).await {
                            Ok(response) => {
                                self.catalog.record_success(&model.id);
                                if response.tool_calls.is_empty() {
                                    State::Done(CompletionResult {
                                        content: response.content.unwrap_or_default(),
                                        tool_invocations: Vec::new(),
                                        model_used: model.id.clone(),
                                        usage: response.usage,
                                    })
                                } else {
                                    State::ToolExecuting { index, response }
                                }
                            }
                            Err(err) => match self.on_failure(&model.id, err) {
                                Ok(err) => {
                                    last_error = Some(err);
                                    State::Calling { index: index + 1 }
                                }
                                Err(fatal) => State::Failed(fatal),
                            },
                        }
                    }
                },

                State::ToolExecuting { index, response } => {
                    let model = &candidates[index].id;
                    info!(model = %model, tools = response.tool_calls.len(), "Executing requested tools");
                    let invocations = self.tools.execute_all(&response.tool_calls).await;
                    State::FollowupCalling {
                        index,
                        conversation: followup_conversation(conversation, &response, &invocations),
                        invocations,
                        usage: response.usage,
                    }
                }

                State::FollowupCalling {
                    index,
                    conversation: followup,
                    invocations,
                    mut usage,
                } => {
                    let model = &candidates[index].id;
                    match self.call(model, &followup, &[]).await {
                        Ok(response) => {
                            if !response.tool_calls.is_empty() {
                                warn!(model = %model, "Follow-up asked for more tools; ignoring");
                            }
                            usage += response.usage;
                            State::Done(CompletionResult {
                                content: response.content.unwrap_or_default(),
                                tool_invocations: invocations,
                                model_used: model.clone(),
                                usage,
                            })
                        }
                        Err(err) => match self.on_failure(model, err) {
                            Ok(err) => {
                                last_error = Some(err);
                                State::Calling { index: index + 1 }
                            }
                            Err(fatal) => State::Failed(fatal),
                        },
                    }
                }

                State::Done(result) => {
                    info!(model = %result.model_used, tokens = result.usage.total_tokens, "Completion succeeded");
                    return Ok(result);
                }

                State::Failed(err) => {
                    warn!(error = %err, "Completion failed");
                    return Err(err);
                }
            };
        }
    }

    /// One vendor call bounded by the configured timeout.
    async fn call(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, ProviderError> {
        let call = self
            .provider
            .chat(model, messages, tools, self.config.max_tokens, self.config.temperature);
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.config.call_timeout)),
        }
    }

    /// Bookkeeping for a failed attempt.
    ///
    /// Returns the error back when the round may continue, or the fatal
    /// error that ends it. Auth failures leave the model's health untouched.
    fn on_failure(&self, model: &str, err: ProviderError) -> Result<ProviderError, EngineError> {
        match err.kind() {
            ErrorKind::Auth => {
                warn!(model = %model, error = %err, "Authentication failure, aborting fallback round");
                Err(EngineError::AuthFailure {
                    model: model.to_string(),
                    source: err,
                })
            }
            kind => {
                warn!(model = %model, error = %err, ?kind, "Model attempt failed, trying next candidate");
                self.catalog.record_failure(model, kind);
                Ok(err)
            }
        }
    }
}

fn exhausted(attempts: usize, last_error: Option<ProviderError>, require_tools: bool, free_only: bool) -> EngineError {
    match last_error {
        Some(last_error) => EngineError::AllModelsFailed { attempts, last_error },
        None => EngineError::NoAvailableModel {
            require_tools,
            free_only,
        },
    }
}

/// The conversation plus the assistant's tool-call turn and one `tool`
/// message per call, in request order.
fn followup_conversation(
    conversation: &[ChatMessage],
    response: &LlmResponse,
    invocations: &[ToolInvocation],
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(conversation.len() + 1 + invocations.len());
    messages.extend_from_slice(conversation);
    messages.push(ChatMessage::assistant_with_tool_calls(
        response.content.as_deref(),
        &response.tool_calls,
    ));
    for invocation in invocations {
        messages.push(ChatMessage::tool_result(&invocation.call_id, &invocation.result_text()));
    }
    messages
}
