//! Streaming variant of the fallback round.
//!
//! Same state machine as [`FallbackEngine::complete`], but content tokens
//! are forwarded as they arrive, tool calls and tool results are announced
//! as discrete events, and a terminal `done` (or `error`) event closes the
//! stream. Tokens already forwarded from a model that later fails are not
//! retracted, so a stream may carry output from more than one model.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{exhausted, followup_conversation, CompletionResult, EngineError, FallbackEngine, State};
use crate::models::ModelDescriptor;
use crate::provider::types::{ChatMessage, LlmResponse, StreamChunk, ToolCallRequest, ToolDefinition, Usage};
use crate::provider::ProviderError;
use crate::tools::ToolInvocation;

const EVENT_BUFFER: usize = 64;

/// Event sent to streaming callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Token {
        content: String,
    },
    ToolCall {
        tool: String,
        args: Value,
    },
    ToolResult {
        tool: String,
        result: Value,
    },
    Done {
        model_used: String,
        content: String,
        usage: Usage,
        tool_invocations: Vec<ToolInvocation>,
    },
    Error {
        kind: String,
        error: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

impl From<CompletionResult> for StreamEvent {
    fn from(result: CompletionResult) -> Self {
        Self::Done {
            model_used: result.model_used,
            content: result.content,
            usage: result.usage,
            tool_invocations: result.tool_invocations,
        }
    }
}

impl From<&EngineError> for StreamEvent {
    fn from(err: &EngineError) -> Self {
        Self::Error {
            kind: err.kind().into(),
            error: err.to_string(),
        }
    }
}

/// Why a streamed attempt stopped early.
enum Interrupted {
    Provider(ProviderError),
    /// The receiver was dropped; nobody is listening.
    Closed,
}

impl From<ProviderError> for Interrupted {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

impl FallbackEngine {
    /// Run a fallback round in the background and stream its events.
    ///
    /// The last event is always `Done` or `Error`, unless the receiver is
    /// dropped first, which stops the round.
    pub fn stream_complete(
        &self,
        conversation: Vec<ChatMessage>,
        require_tools: bool,
        free_only: bool,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.run_stream(&conversation, require_tools, free_only, &tx).await {
                Ok(Ok(result)) => {
                    info!(model = %result.model_used, "Streamed completion succeeded");
                    let _ = tx.send(result.into()).await;
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "Streamed completion failed");
                    let _ = tx.send(StreamEvent::from(&err)).await;
                }
                Err(()) => debug!("Stream receiver dropped, abandoning round"),
            }
        });
        rx
    }

    /// `Err(())` means the receiver went away mid-round.
    async fn run_stream(
        &self,
        conversation: &[ChatMessage],
        require_tools: bool,
        free_only: bool,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<Result<CompletionResult, EngineError>, ()> {
        let tools = self.tool_schemas(require_tools);
        let mut candidates: Vec<ModelDescriptor> = Vec::new();
        let mut last_error: Option<ProviderError> = None;
        let mut state = State::Selecting;

        loop {
            state = match state {
                State::Selecting => {
                    candidates = self.catalog.list_candidates(require_tools, free_only);
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
                        info!(model = %model.id, attempt = index + 1, of = candidates.len(), "Trying model (streaming)");
                        match self.stream_call(&model.id, conversation, &tools, tx).await {
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
                            Err(Interrupted::Closed) => return Err(()),
                            Err(Interrupted::Provider(err)) => match self.on_failure(&model.id, err) {
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
                    let invocations = self.execute_tools_streaming(&response.tool_calls, tx).await?;
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
                    match self.stream_call(model, &followup, &[], tx).await {
                        Ok(response) => {
                            usage += response.usage;
                            State::Done(CompletionResult {
                                content: response.content.unwrap_or_default(),
                                tool_invocations: invocations,
                                model_used: model.clone(),
                                usage,
                            })
                        }
                        Err(Interrupted::Closed) => return Err(()),
                        Err(Interrupted::Provider(err)) => match self.on_failure(model, err) {
                            Ok(err) => {
                                last_error = Some(err);
                                State::Calling { index: index + 1 }
                            }
                            Err(fatal) => State::Failed(fatal),
                        },
                    }
                }

                State::Done(result) => return Ok(Ok(result)),
                State::Failed(err) => return Ok(Err(err)),
            };
        }
    }

    /// One streamed vendor call. The timeout bounds the initial request and
    /// every gap between chunks.
    async fn stream_call(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<LlmResponse, Interrupted> {
        let timeout = self.config.call_timeout;
        let open = self
            .provider
            .chat_stream(model, messages, tools, self.config.max_tokens, self.config.temperature);
        let mut chunks = tokio::time::timeout(timeout, open)
            .await
            .map_err(|_| ProviderError::Timeout(timeout))??;

        let mut response = LlmResponse::default();
        let mut content = String::new();

        loop {
            let next = tokio::time::timeout(timeout, chunks.recv())
                .await
                .map_err(|_| ProviderError::Timeout(timeout))?;
            match next {
                None => break,
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(StreamChunk::Text(text))) => {
                    content.push_str(&text);
                    send(tx, StreamEvent::Token { content: text }).await?;
                }
                Some(Ok(StreamChunk::ToolCall(call))) => {
                    send(
                        tx,
                        StreamEvent::ToolCall {
                            tool: call.name.clone(),
                            args: call.arguments_value(),
                        },
                    )
                    .await?;
                    response.tool_calls.push(call);
                }
                Some(Ok(StreamChunk::Usage(usage))) => response.usage = usage,
                Some(Ok(StreamChunk::Finished(reason))) => response.finish_reason = reason,
            }
        }

        if !content.is_empty() {
            response.content = Some(content);
        }
        Ok(response)
    }

    /// Run tool calls concurrently, emitting each result as it finishes.
    /// The returned list is in call order.
    async fn execute_tools_streaming(
        &self,
        calls: &[ToolCallRequest],
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<Vec<ToolInvocation>, ()> {
        let mut pending: FuturesUnordered<_> = calls
            .iter()
            .enumerate()
            .map(|(i, call)| async move { (i, self.tools.execute_call(call).await) })
            .collect();

        let mut slots: Vec<Option<ToolInvocation>> = vec![None; calls.len()];
        while let Some((i, invocation)) = pending.next().await {
            let event = StreamEvent::ToolResult {
                tool: invocation.tool_name.clone(),
                result: invocation.result.clone(),
            };
            if tx.send(event).await.is_err() {
                return Err(());
            }
            slots[i] = Some(invocation);
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

async fn send(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<(), Interrupted> {
    tx.send(event).await.map_err(|_| Interrupted::Closed)
}
