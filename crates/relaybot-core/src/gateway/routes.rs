//! Route handlers. Each one is a thin mapping onto the orchestrator or the
//! model catalog.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::info;

use super::{ApiError, AppState};
use crate::agent::ChatReply;
use crate::history::HistoryRecord;
use crate::models::AdminAction;

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub use_tools: Option<bool>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AvailableQuery {
    #[serde(default)]
    pub require_tools: bool,
}

#[derive(Debug, Deserialize)]
pub struct CurrentQuery {
    #[serde(default)]
    pub require_tools: bool,
    #[serde(default = "default_prefer_free")]
    pub prefer_free: bool,
}

fn default_prefer_free() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub model_id: String,
    pub action: String,
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let engine = state.orchestrator.engine();
    Json(json!({
        "status": "healthy",
        "models": engine.catalog().len(),
        "tools": engine.tools().names(),
    }))
}

pub async fn create_session(State(state): State<AppState>) -> Json<Value> {
    let session_id = state.orchestrator.create_session().await;
    Json(json!({ "session_id": session_id }))
}

pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    let session_id = state
        .orchestrator
        .ensure_session(request.session_id.as_deref())
        .await;
    let use_tools = request.use_tools.unwrap_or(state.default_use_tools);

    let reply = state
        .orchestrator
        .process(&session_id, &request.message, use_tools)
        .await?;
    Ok(Json(reply))
}

/// Server-sent events, one JSON `StreamEvent` per event. The session id
/// travels in the `x-session-id` response header.
pub async fn stream_message(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = state
        .orchestrator
        .ensure_session(request.session_id.as_deref())
        .await;
    let use_tools = request.use_tools.unwrap_or(state.default_use_tools);

    let rx = state
        .orchestrator
        .process_stream(&session_id, &request.message, use_tools)
        .await?;
    let events = ReceiverStream::new(rx).map(|event| Event::default().json_data(&event));

    Ok((
        [("x-session-id", session_id)],
        Sse::new(events).keep_alive(KeepAlive::default()),
    ))
}

pub async fn chat_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let records = state.orchestrator.history(&session_id, limit).await?;
    Ok(Json(records))
}

pub async fn list_tools(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "tools": state.orchestrator.engine().tools().descriptors() }))
}

/// Catalog plus the order a tool-calling round would try right now.
pub async fn chat_models(State(state): State<AppState>) -> Json<Value> {
    let catalog = state.orchestrator.engine().catalog();
    let fallback_order: Vec<String> = catalog
        .list_candidates(true, state.free_only)
        .into_iter()
        .map(|m| m.id)
        .collect();

    Json(json!({
        "fallback_free_only": state.free_only,
        "available_models": catalog.snapshot(),
        "fallback_order": fallback_order,
    }))
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let models = state.orchestrator.engine().catalog().snapshot();
    Json(json!({ "total": models.len(), "models": models }))
}

pub async fn available_models(
    State(state): State<AppState>,
    Query(query): Query<AvailableQuery>,
) -> Json<Value> {
    let models = state
        .orchestrator
        .engine()
        .catalog()
        .list_candidates(query.require_tools, false);
    Json(json!({
        "total": models.len(),
        "require_tools": query.require_tools,
        "models": models,
    }))
}

pub async fn current_model(
    State(state): State<AppState>,
    Query(query): Query<CurrentQuery>,
) -> Result<Json<Value>, ApiError> {
    let model = state
        .orchestrator
        .engine()
        .catalog()
        .best_model(query.require_tools, query.prefer_free)
        .ok_or(ApiError::NoModel)?;

    Ok(Json(json!({
        "id": model.id,
        "name": model.name,
        "supports_tools": model.supports_tools,
        "is_free": model.is_free,
        "context_length": model.context_length,
        "selection_criteria": {
            "require_tools": query.require_tools,
            "prefer_free": query.prefer_free,
        },
    })))
}

pub async fn update_model_status(
    State(state): State<AppState>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Value>, ApiError> {
    let catalog = state.orchestrator.engine().catalog();
    catalog.get(&update.model_id)?;
    let action: AdminAction = update.action.parse()?;

    let model = catalog.apply_admin_action(&update.model_id, action)?;
    let verb = match action {
        AdminAction::Enable => "enabled",
        AdminAction::Disable => "disabled",
        AdminAction::Reset => "reset",
    };
    info!(model = %model.id, action = verb, "Admin status update");

    Ok(Json(json!({
        "message": format!("Model {} {}", model.id, verb),
        "status": model.status,
    })))
}
