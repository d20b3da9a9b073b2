//! OpenRouter (OpenAI-compatible) completion provider.
//!
//! OpenRouter exposes the OpenAI `/chat/completions` contract in front of
//! many vendors, so this client works against any compatible endpoint
//! (OpenAI, vLLM, a local mock) by overriding the base URL.
//!
//! No SDK dependency, just direct HTTP via `reqwest`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::ProviderError;
use super::sse::{self, Decoded, SseDecoder, ToolCallAccumulator};
use super::types::{ChatMessage, LlmResponse, StreamChunk, ToolCallRequest, ToolDefinition, Usage};
use super::{ChunkStream, LlmProvider};

/// Default OpenRouter API base.
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Channel capacity for streamed chunks.
const STREAM_BUFFER: usize = 64;

/// OpenRouter provider.
pub struct OpenRouterProvider {
    client: Client,
    api_key: String,
    base_url: String,
    referer: String,
    title: String,
}

impl OpenRouterProvider {
    /// Create a new provider.
    ///
    /// # Arguments
    /// * `api_key` - OpenRouter API key
    /// * `api_base` - Custom base URL (None = OpenRouter)
    /// * `referer` / `title` - Attribution headers OpenRouter shows on its dashboard
    pub fn new(api_key: &str, api_base: Option<&str>, referer: &str, title: &str, client: Client) -> Self {
        let base_url = api_base
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        debug!(base_url = %base_url, "Initialized OpenRouter provider");

        Self {
            client,
            api_key: api_key.to_string(),
            base_url,
            referer: referer.to_string(),
            title: title.to_string(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(&self, request: &CompletionRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("unable to read error body: {}", e));
        let message = extract_error_message(&body);
        warn!(model = request.model, status = %status, error = body_snippet(&message), "Completion API returned an error");
        Err(ProviderError::from_status(status.as_u16(), message))
    }
}

// ── OpenAI API request/response types ───────────────────────────────

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl<'a> CompletionRequest<'a> {
    fn new(
        model: &'a str,
        messages: &'a [ChatMessage],
        tools: &'a [ToolDefinition],
        max_tokens: u32,
        temperature: f32,
        stream: bool,
    ) -> Self {
        let tools = (!tools.is_empty()).then_some(tools);
        Self {
            model,
            messages,
            max_tokens,
            temperature,
            tools,
            tool_choice: tools.map(|_| "auto"),
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageResponse>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageResponse,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallResponse>>,
}

#[derive(Deserialize)]
struct ToolCallResponse {
    id: String,
    function: FunctionCallResponse,
}

#[derive(Deserialize)]
struct FunctionCallResponse {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct UsageResponse {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorResponse {
    Single(ErrorBody),
    Multiple(Vec<ErrorBody>),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl ErrorResponse {
    fn message(&self) -> String {
        match self {
            Self::Single(b) => b.error.message.clone(),
            Self::Multiple(v) => v
                .first()
                .map(|b| b.error.message.clone())
                .unwrap_or_else(|| "Unknown error".into()),
        }
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.message())
        .unwrap_or_else(|_| body.trim().to_string())
}

fn body_snippet(message: &str) -> &str {
    match message.char_indices().nth(200) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}

fn parse_completion(body: &str) -> Result<LlmResponse, ProviderError> {
    let completion: CompletionResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;

    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or(ProviderError::EmptyResponse)?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCallRequest::new(tc.id, tc.function.name, tc.function.arguments))
        .collect();

    let usage = completion.usage.map_or(Usage::default(), |u| Usage {
        prompt_tokens: u.prompt_tokens.unwrap_or(0),
        completion_tokens: u.completion_tokens.unwrap_or(0),
        total_tokens: u.total_tokens.unwrap_or(0),
    });

    Ok(LlmResponse {
        content: choice.message.content,
        tool_calls,
        finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".into()),
        usage,
    })
}

// ── LlmProvider implementation ──────────────────────────────────────

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<LlmResponse, ProviderError> {
        let request = CompletionRequest::new(model, messages, tools, max_tokens, temperature, false);
        debug!(model, msg_count = messages.len(), tools = tools.len(), "Sending chat completion request");

        let response = self.send(&request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to read response body: {}", e)))?;

        let parsed = parse_completion(&body)?;
        debug!(
            model,
            finish_reason = %parsed.finish_reason,
            tool_calls = parsed.tool_calls.len(),
            tokens = parsed.usage.total_tokens,
            "Received chat completion"
        );
        Ok(parsed)
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<ChunkStream, ProviderError> {
        let request = CompletionRequest::new(model, messages, tools, max_tokens, temperature, true);
        debug!(model, msg_count = messages.len(), tools = tools.len(), "Sending streaming chat completion request");

        let mut response = self.send(&request).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let model = model.to_string();

        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            let mut accumulator = ToolCallAccumulator::default();

            loop {
                let bytes = match response.chunk().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::Transport(format!("stream dropped: {}", e))))
                            .await;
                        return;
                    }
                };

                let payloads = match decoder.feed(&bytes) {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Parse(e))).await;
                        return;
                    }
                };

                match forward_payloads(payloads, &tx, &mut accumulator).await {
                    Forwarded::Continue => {}
                    Forwarded::Done => {
                        flush_tool_calls(accumulator, &tx).await;
                        return;
                    }
                    Forwarded::Stop => return,
                }
            }

            let payloads = match decoder.finish() {
                Ok(p) => p,
                Err(e) => {
                    let _ = tx.send(Err(ProviderError::Parse(e))).await;
                    return;
                }
            };
            match forward_payloads(payloads, &tx, &mut accumulator).await {
                Forwarded::Done => flush_tool_calls(accumulator, &tx).await,
                Forwarded::Continue => {
                    warn!(model = %model, "Stream ended before [DONE] sentinel");
                    let _ = tx
                        .send(Err(ProviderError::Transport("stream ended before [DONE]".into())))
                        .await;
                }
                Forwarded::Stop => {}
            }
        });

        Ok(rx)
    }

    fn name(&self) -> &str {
        "openrouter"
    }
}

enum Forwarded {
    Continue,
    Done,
    Stop,
}

async fn forward_payloads(
    payloads: Vec<String>,
    tx: &mpsc::Sender<Result<StreamChunk, ProviderError>>,
    accumulator: &mut ToolCallAccumulator,
) -> Forwarded {
    for payload in payloads {
        let chunk = match sse::parse_stream_payload(&payload) {
            Ok(Decoded::Done) => return Forwarded::Done,
            Ok(Decoded::Chunk(chunk)) => chunk,
            Err(e) => {
                let _ = tx.send(Err(ProviderError::Parse(e))).await;
                return Forwarded::Stop;
            }
        };

        if let Some((status, message)) = sse::stream_error(&chunk) {
            let _ = tx.send(Err(ProviderError::from_status(status, message))).await;
            return Forwarded::Stop;
        }

        for item in sse::normalize_chunk(chunk, accumulator) {
            if tx.send(Ok(item)).await.is_err() {
                // Receiver went away; nobody is listening any more.
                return Forwarded::Stop;
            }
        }
    }
    Forwarded::Continue
}

async fn flush_tool_calls(
    accumulator: ToolCallAccumulator,
    tx: &mpsc::Sender<Result<StreamChunk, ProviderError>>,
) {
    for call in accumulator.finish() {
        if tx.send(Ok(StreamChunk::ToolCall(call))).await.is_err() {
            return;
        }
    }
}
