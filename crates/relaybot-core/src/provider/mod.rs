//! LLM provider trait and the OpenRouter implementation.
//!
//! Defines the `LlmProvider` trait that completion backends implement.
//! Providers make exactly one vendor call per invocation: retrying and
//! switching models is the fallback engine's job, not the provider's.

pub mod error;
pub mod openai;
pub mod sse;
pub mod types;

#[cfg(test)]
pub(crate) mod scripted;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use error::{ErrorKind, ProviderError};
use types::{ChatMessage, LlmResponse, StreamChunk, ToolDefinition};

/// Receiving half of a streamed completion.
///
/// The stream completed successfully when the channel closes without an
/// `Err` item; an `Err` item is always the last one sent.
pub type ChunkStream = mpsc::Receiver<Result<StreamChunk, ProviderError>>;

/// Trait for completion backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request for `model`.
    ///
    /// # Arguments
    /// * `model` - Vendor model identifier
    /// * `messages` - Conversation history
    /// * `tools` - Tool definitions (empty = no tool calling)
    /// * `max_tokens` - Maximum response tokens
    /// * `temperature` - Sampling temperature
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<LlmResponse, ProviderError>;

    /// Streaming variant of [`LlmProvider::chat`].
    ///
    /// Returns once the upstream accepted the request; HTTP-level failures
    /// are reported here, mid-stream failures as `Err` items.
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<ChunkStream, ProviderError>;

    /// Short backend name for logs.
    fn name(&self) -> &str;
}
