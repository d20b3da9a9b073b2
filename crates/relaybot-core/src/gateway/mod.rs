//! HTTP gateway: JSON routes for chat, history, tools and model
//! administration, plus a server-sent-events stream.
//!
//! Errors never come back as a 200; every failure is a status code with a
//! `{"error": kind, "message": text}` body.

pub mod routes;

use anyhow::Context;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentError, ChatOrchestrator};
use crate::engine::EngineError;
use crate::models::CatalogError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ChatOrchestrator,
    /// Used when a request does not say whether to offer tools.
    pub default_use_tools: bool,
    pub free_only: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/chat/session", post(routes::create_session))
        .route("/api/chat/message", post(routes::send_message))
        .route("/api/chat/stream", post(routes::stream_message))
        .route("/api/chat/history/:session_id", get(routes::chat_history))
        .route("/api/chat/tools", get(routes::list_tools))
        .route("/api/chat/models", get(routes::chat_models))
        .route("/api/models/list", get(routes::list_models))
        .route("/api/models/available", get(routes::available_models))
        .route("/api/models/current", get(routes::current_model))
        .route("/api/models/status", post(routes::update_model_status))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(host: &str, port: u16, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("binding {}:{}", host, port))?;
    info!(addr = %listener.local_addr()?, "Gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Gateway stopped");
    Ok(())
}

/// Handler error with its HTTP mapping.
#[derive(Debug)]
pub enum ApiError {
    Agent(AgentError),
    Catalog(CatalogError),
    /// No model matches the requested selection criteria.
    NoModel,
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self::Agent(err)
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        Self::Catalog(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Agent(AgentError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
            Self::Agent(AgentError::Engine(EngineError::NoAvailableModel { .. })) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Agent(AgentError::Engine(_)) => StatusCode::BAD_GATEWAY,
            Self::Agent(AgentError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Catalog(CatalogError::UnknownModel(_)) => StatusCode::NOT_FOUND,
            Self::Catalog(CatalogError::InvalidAction(_)) => StatusCode::BAD_REQUEST,
            Self::Catalog(CatalogError::DuplicateModel(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoModel => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Agent(e) => e.kind(),
            Self::Catalog(CatalogError::UnknownModel(_)) => "unknown_model",
            Self::Catalog(CatalogError::InvalidAction(_)) => "invalid_action",
            Self::Catalog(CatalogError::DuplicateModel(_)) => "duplicate_model",
            Self::NoModel => "no_available_model",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Agent(e) => e.to_string(),
            Self::Catalog(e) => e.to_string(),
            Self::NoModel => "No available models found".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.message(), "Request failed");
        }
        let body = json!({ "error": self.kind(), "message": self.message() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::OrchestratorConfig;
    use crate::engine::tests::{abc_catalog, engine};
    use crate::history::JsonlHistoryStore;
    use crate::provider::scripted::{self, ScriptedProvider};
    use crate::provider::types::ToolCallRequest;
    use crate::provider::ProviderError;
    use crate::session::MemorySessionStore;
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    struct TestServer {
        addr: SocketAddr,
        provider: Arc<ScriptedProvider>,
        client: reqwest::Client,
        history_dir: PathBuf,
        shutdown: CancellationToken,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        async fn get(&self, path: &str) -> (u16, Value) {
            let resp = self.client.get(self.url(path)).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap())
        }

        async fn post(&self, path: &str, body: Value) -> (u16, Value) {
            let resp = self.client.post(self.url(path)).json(&body).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap())
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.shutdown.cancel();
            let _ = std::fs::remove_dir_all(&self.history_dir);
        }
    }

    async fn spawn_server() -> TestServer {
        let provider = Arc::new(ScriptedProvider::new());
        let history_dir = std::env::temp_dir().join(format!("relaybot-gateway-{}", uuid::Uuid::new_v4()));
        let orchestrator = ChatOrchestrator::new(
            engine(Arc::clone(&provider), abc_catalog()),
            Arc::new(MemorySessionStore::new(Duration::from_secs(3600), 20)),
            Arc::new(JsonlHistoryStore::new(history_dir.clone())),
            OrchestratorConfig {
                system_prompt: "You are helpful.".into(),
                history_window: 10,
                free_only: true,
                background_writes: false,
            },
        );
        let state = AppState {
            orchestrator,
            default_use_tools: true,
            free_only: true,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router(state))
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .ok();
        });

        TestServer {
            addr,
            provider,
            client: reqwest::Client::new(),
            history_dir,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_health() {
        let server = spawn_server().await;
        let (status, body) = server.get("/health").await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["models"], 3);
    }

    #[tokio::test]
    async fn test_message_creates_session_and_answers() {
        let server = spawn_server().await;
        server.provider.push("a", scripted::text("Hi!", 8));

        let (status, body) = server.post("/api/chat/message", json!({"message": "hello"})).await;
        assert_eq!(status, 200);
        assert_eq!(body["response"], "Hi!");
        assert_eq!(body["model_used"], "a");
        assert_eq!(body["usage"]["total_tokens"], 8);
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let (status, history) = server
            .get(&format!("/api/chat/history/{}?limit=5", session_id))
            .await;
        assert_eq!(status, 200);
        assert_eq!(history[0]["user_message"], "hello");
    }

    #[tokio::test]
    async fn test_message_reports_tools_used() {
        let server = spawn_server().await;
        server.provider.push(
            "a",
            scripted::tool_calls(
                vec![ToolCallRequest::new("call_1", "calculator", r#"{"expression":"10/0"}"#)],
                4,
            ),
        );
        server.provider.push("a", scripted::text("You cannot divide by zero.", 4));

        let (status, body) = server.post("/api/chat/message", json!({"message": "10/0?"})).await;
        assert_eq!(status, 200);
        assert_eq!(body["tools_used"][0]["tool"], "calculator");
        assert_eq!(body["tools_used"][0]["args"]["expression"], "10/0");
        assert_eq!(body["tools_used"][0]["result"]["success"], false);
    }

    #[tokio::test]
    async fn test_engine_failures_map_to_status_codes() {
        let server = spawn_server().await;
        server
            .provider
            .push("a", Err(ProviderError::from_status(401, "Invalid API key".into())));
        let (status, body) = server.post("/api/chat/message", json!({"message": "hi"})).await;
        assert_eq!(status, 502);
        assert_eq!(body["error"], "auth_failure");

        // Tools off still has a, b and c; disabling all three leaves nothing.
        for id in ["a", "b", "c"] {
            server
                .post("/api/models/status", json!({"model_id": id, "action": "disable"}))
                .await;
        }
        let (status, body) = server
            .post("/api/chat/message", json!({"message": "hi", "use_tools": false}))
            .await;
        assert_eq!(status, 503);
        assert_eq!(body["error"], "no_available_model");
    }

    #[tokio::test]
    async fn test_history_for_unknown_session_is_404() {
        let server = spawn_server().await;
        let (status, body) = server.get("/api/chat/history/missing").await;
        assert_eq!(status, 404);
        assert_eq!(body["error"], "session_not_found");
    }

    #[tokio::test]
    async fn test_model_admin_routes() {
        let server = spawn_server().await;

        let (status, body) = server
            .post("/api/models/status", json!({"model_id": "a", "action": "disable"}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "disabled");
        assert_eq!(body["message"], "Model a disabled");

        let (_, available) = server.get("/api/models/available?require_tools=true").await;
        assert_eq!(available["total"], 1);
        assert_eq!(available["models"][0]["id"], "b");

        let (_, current) = server.get("/api/models/current?require_tools=true").await;
        assert_eq!(current["id"], "b");

        let (_, listed) = server.get("/api/models/list").await;
        assert_eq!(listed["total"], 3);
        assert_eq!(listed["models"][0]["status"], "disabled");

        let (status, body) = server
            .post("/api/models/status", json!({"model_id": "zzz", "action": "enable"}))
            .await;
        assert_eq!(status, 404);
        assert_eq!(body["error"], "unknown_model");

        let (status, body) = server
            .post("/api/models/status", json!({"model_id": "a", "action": "explode"}))
            .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], "invalid_action");
    }

    #[tokio::test]
    async fn test_tools_listing() {
        let server = spawn_server().await;
        let (status, body) = server.get("/api/chat/tools").await;
        assert_eq!(status, 200);
        let names: Vec<&str> = body["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["calculator", "weather"]);
        assert_eq!(body["tools"][0]["parameters"][0]["name"], "expression");
    }

    #[tokio::test]
    async fn test_stream_emits_sse_events() {
        let server = spawn_server().await;
        server.provider.push("a", scripted::text("two words", 3));

        let resp = server
            .client
            .post(server.url("/api/chat/stream"))
            .json(&json!({"message": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(resp.headers().contains_key("x-session-id"));
        let body = resp.text().await.unwrap();

        let events: Vec<Value> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .map(|d| serde_json::from_str(d.trim()).unwrap())
            .collect();
        assert_eq!(events.first().unwrap()["type"], "token");
        let done = events.last().unwrap();
        assert_eq!(done["type"], "done");
        assert_eq!(done["model_used"], "a");
        assert_eq!(done["content"], "two words");
    }
}
