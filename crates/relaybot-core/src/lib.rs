//! relaybot-core: chat backend with model fallback and tool calling.
//!
//! - [`config`]: Typed configuration loading from JSON
//! - [`provider`]: LLM provider trait and the OpenRouter implementation
//! - [`models`]: Model catalog with per-model health state
//! - [`tools`]: Tool trait, registry and built-in tools
//! - [`engine`]: Fallback completion engine (blocking and streaming)
//! - [`session`]: Short-lived conversation sessions with TTL
//! - [`history`]: Durable JSONL chat transcripts
//! - [`agent`]: Chat orchestrator tying the pieces together
//! - [`gateway`]: HTTP routes over the orchestrator
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use relaybot_core::config::Config;
//! use relaybot_core::engine::{EngineConfig, FallbackEngine};
//! use relaybot_core::models::ModelCatalog;
//! use relaybot_core::provider::openai::OpenRouterProvider;
//! use relaybot_core::provider::types::ChatMessage;
//! use relaybot_core::tools::builtin_registry;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let client = reqwest::Client::new();
//! let provider = OpenRouterProvider::new(
//!     &config.provider.api_key,
//!     Some(config.provider.api_base.as_str()),
//!     &config.provider.referer,
//!     &config.provider.title,
//!     client.clone(),
//! );
//! let catalog = ModelCatalog::new(config.models.0.clone())?;
//! let tools = builtin_registry(&config.tools, client);
//! let engine = FallbackEngine::new(
//!     Arc::new(provider),
//!     Arc::new(catalog),
//!     Arc::new(tools),
//!     EngineConfig::default(),
//! );
//!
//! let result = engine
//!     .complete(&[ChatMessage::user("What is 2+2?")], true, true)
//!     .await?;
//! println!("{} (via {})", result.content, result.model_used);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod history;
pub mod models;
pub mod provider;
pub mod session;
pub mod tools;
