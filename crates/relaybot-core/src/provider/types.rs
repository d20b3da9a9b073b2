//! LLM provider types shared across the engine, the tools and the stores.
//!
//! These types define the contract between the fallback engine and any
//! completion backend. Every provider turns a list of `ChatMessage`s into an
//! `LlmResponse` (or a stream of `StreamChunk`s).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::AddAssign;

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A single message in a conversation.
///
/// `content` may be empty when an assistant message only carries tool-call
/// directives. A `tool` message always points back at the call that
/// produced it through `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: &str) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: Option<&str>, calls: &[ToolCallRequest]) -> Self {
        Self {
            role: Role::Assistant,
            content: content.unwrap_or_default().into(),
            tool_calls: Some(calls.iter().map(ToolCallMessage::from).collect()),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, result: &str) -> Self {
        Self {
            role: Role::Tool,
            content: result.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool call embedded in an assistant message (OpenAI wire format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

/// The function name + raw JSON arguments within a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl From<&ToolCallRequest> for ToolCallMessage {
    fn from(call: &ToolCallRequest) -> Self {
        Self {
            id: call.id.clone(),
            call_type: "function".into(),
            function: FunctionCall {
                name: call.name.clone(),
                arguments: call.raw_arguments.clone(),
            },
        }
    }
}

/// A tool call requested by the model.
///
/// The raw argument string is kept verbatim so the assistant message can be
/// echoed back unchanged; parsing happens on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, raw_arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            raw_arguments: raw_arguments.into(),
        }
    }

    /// Parse the arguments as a JSON object. An empty string means "no arguments".
    pub fn arguments(&self) -> Result<Map<String, Value>, String> {
        let raw = self.raw_arguments.trim();
        if raw.is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(format!("expected a JSON object, got {}", other)),
            Err(e) => Err(format!("invalid JSON arguments: {}", e)),
        }
    }

    /// Arguments as a JSON value for reporting; falls back to the raw string.
    pub fn arguments_value(&self) -> Value {
        self.arguments()
            .map(Value::Object)
            .unwrap_or_else(|_| Value::String(self.raw_arguments.clone()))
    }
}

/// Response from a single (non-streaming) completion call.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: String,
    pub usage: Usage,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Incremental piece of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Content delta.
    Text(String),
    /// A fully assembled tool call (emitted once its arguments are complete).
    ToolCall(ToolCallRequest),
    /// Usage totals, usually sent in the last chunk.
    Usage(Usage),
    /// The model finished; carries the vendor finish reason.
    Finished(String),
}

/// Tool definition in OpenAI function-calling format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub def_type: String,
    pub function: ToolFunctionDef,
}

/// Function metadata within a tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}
