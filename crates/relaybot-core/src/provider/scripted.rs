//! Scripted provider for engine and orchestrator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::ProviderError;
use super::types::{ChatMessage, LlmResponse, StreamChunk, ToolCallRequest, ToolDefinition, Usage};
use super::{ChunkStream, LlmProvider};

/// One call the provider received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

enum Script {
    Reply(Result<LlmResponse, ProviderError>),
    /// Streams `partial` word by word, then fails with `error`.
    Broken { partial: String, error: ProviderError },
}

/// Replays canned responses per model, in order.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push(&self, model: &str, outcome: Result<LlmResponse, ProviderError>) -> &Self {
        self.enqueue(model, Script::Reply(outcome))
    }

    /// A stream that opens, yields `partial` and then breaks with `error`.
    /// A non-streaming call fails with `error` straight away.
    pub fn push_broken_stream(&self, model: &str, partial: &str, error: ProviderError) -> &Self {
        self.enqueue(
            model,
            Script::Broken {
                partial: partial.to_string(),
                error,
            },
        )
    }

    fn enqueue(&self, model: &str, script: Script) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(script);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, model: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.model == model).count()
    }

    async fn next(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Script {
        self.calls.lock().unwrap().push(RecordedCall {
            model: model.to_string(),
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|t| t.function.name.clone()).collect(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(|queue| queue.pop_front());
        next.unwrap_or_else(|| {
            Script::Reply(Err(ProviderError::Http {
                status: 500,
                message: format!("no scripted response for {}", model),
            }))
        })
    }
}

/// Plain text answer.
pub fn text(content: &str, total_tokens: u32) -> Result<LlmResponse, ProviderError> {
    Ok(LlmResponse {
        content: Some(content.to_string()),
        tool_calls: Vec::new(),
        finish_reason: "stop".into(),
        usage: usage(total_tokens),
    })
}

/// Answer that only requests tool calls.
pub fn tool_calls(calls: Vec<ToolCallRequest>, total_tokens: u32) -> Result<LlmResponse, ProviderError> {
    Ok(LlmResponse {
        content: None,
        tool_calls: calls,
        finish_reason: "tool_calls".into(),
        usage: usage(total_tokens),
    })
}

fn usage(total_tokens: u32) -> Usage {
    let prompt_tokens = total_tokens / 2;
    Usage {
        prompt_tokens,
        completion_tokens: total_tokens - prompt_tokens,
        total_tokens,
    }
}

fn words(content: &str) -> Vec<Result<StreamChunk, ProviderError>> {
    content
        .split_inclusive(' ')
        .map(|piece| Ok(StreamChunk::Text(piece.to_string())))
        .collect()
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        _max_tokens: u32,
        _temperature: f32,
    ) -> Result<LlmResponse, ProviderError> {
        match self.next(model, messages, tools).await {
            Script::Reply(outcome) => outcome,
            Script::Broken { error, .. } => Err(error),
        }
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        _max_tokens: u32,
        _temperature: f32,
    ) -> Result<ChunkStream, ProviderError> {
        let chunks = match self.next(model, messages, tools).await {
            Script::Reply(outcome) => {
                let response = outcome?;
                let mut chunks = words(response.content.as_deref().unwrap_or_default());
                chunks.extend(response.tool_calls.into_iter().map(|call| Ok(StreamChunk::ToolCall(call))));
                chunks.push(Ok(StreamChunk::Finished(response.finish_reason)));
                chunks.push(Ok(StreamChunk::Usage(response.usage)));
                chunks
            }
            Script::Broken { partial, error } => {
                let mut chunks = words(&partial);
                chunks.push(Err(error));
                chunks
            }
        };

        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            let _ = tx.send(chunk).await;
        }
        Ok(rx)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
