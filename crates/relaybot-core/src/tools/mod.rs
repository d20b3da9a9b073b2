//! Tool system: trait, registry, and built-in tool implementations.
//!
//! Every tool implements the `Tool` trait and registers itself in the
//! `ToolRegistry`. The engine asks the registry for function-calling
//! schemas and dispatches the model's tool calls by name.
//!
//! Tool failures are data: a failing tool produces an error-shaped JSON
//! result that is handed back to the model, never an `Err` that would abort
//! the completion. The only `Err` the registry returns is `UnknownTool`
//! from [`ToolRegistry::execute`].

pub mod calculator;
pub mod search;
pub mod weather;
pub mod web;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ToolsConfig;
use crate::provider::types::{ToolCallRequest, ToolDefinition, ToolFunctionDef};

/// Primitive type tag of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn required(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }
}

/// Errors raised while running a tool.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("Tool '{0}' not found")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Execution(String),
}

/// Trait that all tools must implement.
///
/// Each tool declares its name, description, typed parameter list, and an
/// async `execute` method returning a JSON payload.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name used in function calls (e.g., "calculator").
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// Ordered parameter declarations.
    fn parameters(&self) -> Vec<ToolParameter>;

    /// Execute the tool with the given arguments.
    ///
    /// Required parameters have already been checked by the registry.
    async fn execute(&self, args: HashMap<String, Value>) -> Result<Value, ToolError>;
}

/// Human-readable tool listing.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

/// A tool call that was executed, with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result: Value,
}

impl ToolInvocation {
    /// Result as the text of a `tool` message.
    pub fn result_text(&self) -> String {
        self.result.to_string()
    }
}

/// Error-shaped tool result.
pub fn error_result(message: impl std::fmt::Display) -> Value {
    json!({ "success": false, "error": message.to_string() })
}

/// Read an integer argument, accepting `3`, `3.0` and `"3"`.
pub(crate) fn int_arg(args: &HashMap<String, Value>, key: &str) -> Option<u64> {
    let value = args.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Build the JSON Schema `parameters` object from a declaration list.
pub fn parameters_schema(params: &[ToolParameter]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for p in params {
        properties.insert(
            p.name.clone(),
            json!({ "type": p.param_type.as_str(), "description": p.description }),
        );
        if p.required {
            required.push(Value::String(p.name.clone()));
        }
    }
    json!({ "type": "object", "properties": properties, "required": required })
}

/// Registry of tools, addressed by unique name.
///
/// Registration order is kept so that `describe_all` is deterministic.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced in place.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "Registered tool");
        match self.index.get(&name) {
            Some(&i) => self.tools[i] = tool,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.index.get(name).map(|&i| self.tools[i].as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Function-calling schemas, in registration order.
    pub fn describe_all(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ToolDefinition {
                def_type: "function".into(),
                function: ToolFunctionDef {
                    name: tool.name().into(),
                    description: tool.description().into(),
                    parameters: parameters_schema(&tool.parameters()),
                },
            })
            .collect()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name().into(),
                description: tool.description().into(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Run a tool by name.
    ///
    /// Missing required parameters and tool failures come back as an
    /// error-shaped `Ok` value.
    pub async fn execute(&self, name: &str, args: HashMap<String, Value>) -> Result<Value, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let missing: Vec<String> = tool
            .parameters()
            .into_iter()
            .filter(|p| p.required && args.get(&p.name).map_or(true, Value::is_null))
            .map(|p| p.name)
            .collect();
        if !missing.is_empty() {
            let err = ToolError::InvalidArguments(format!("missing required parameter(s): {}", missing.join(", ")));
            warn!(tool = name, error = %err, "Rejected tool call");
            return Ok(error_result(err));
        }

        debug!(tool = name, "Executing tool");
        match tool.execute(args).await {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(tool = name, error = %err, "Tool failed");
                Ok(error_result(err))
            }
        }
    }

    /// Run one model-requested call. Never fails: unknown tools and bad
    /// arguments become error-shaped results.
    pub async fn execute_call(&self, call: &ToolCallRequest) -> ToolInvocation {
        let result = match call.arguments() {
            Ok(map) => match self.execute(&call.name, map.into_iter().collect()).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(tool = %call.name, "Model requested an unknown tool");
                    error_result(err)
                }
            },
            Err(message) => {
                warn!(tool = %call.name, error = %message, "Unparsable tool arguments");
                error_result(ToolError::InvalidArguments(message))
            }
        };

        ToolInvocation {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments_value(),
            result,
        }
    }

    /// Run every call of one assistant turn.
    ///
    /// A single call runs inline; several run concurrently. The output is
    /// in request order regardless of completion order.
    pub async fn execute_all(&self, calls: &[ToolCallRequest]) -> Vec<ToolInvocation> {
        match calls {
            [] => Vec::new(),
            [single] => vec![self.execute_call(single).await],
            many => join_all(many.iter().map(|call| self.execute_call(call))).await,
        }
    }
}

/// Registry with every built-in tool enabled by `config`.
pub fn builtin_registry(config: &ToolsConfig, client: Client) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(calculator::CalculatorTool));
    registry.register(Box::new(weather::WeatherTool));
    registry.register(Box::new(search::SearchTool));
    if config.web_search.enabled {
        registry.register(Box::new(web::WebSearchTool::new(client, config.web_search.max_results)));
    }
    registry
}
