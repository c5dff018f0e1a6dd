use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::db::DbHandle;
use super::models::{Session, SessionFilter, Trigger, TriggerEvent, WorkflowCommand};
use super::orchestrator::{CancelOutcome, SessionOrchestrator};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub orchestrator: Arc<SessionOrchestrator>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

/// Operator-initiated trigger; skips comment parsing and the allowlist.
#[derive(Deserialize)]
pub struct ManualTriggerRequest {
    pub repo: String,
    pub number: u64,
    #[serde(default)]
    pub is_pull_request: bool,
    pub command: String,
    pub instruction: Option<String>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub session_id: String,
    pub status: &'static str,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::Internal(format!("{:#}", e))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/events", post(receive_event))
        .route("/api/triggers", post(manual_trigger))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .route("/api/scopes/{owner}/{repo}/{number}", get(get_scope))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn start(state: &SharedState, trigger: Trigger) -> Result<(StatusCode, Json<Session>), ApiError> {
    if !trigger.repo.contains('/') {
        return Err(ApiError::BadRequest(format!(
            "Repository must be owner/name, got '{}'",
            trigger.repo
        )));
    }
    let task = state.orchestrator.start(trigger).await.map_err(internal)?;
    let id = task.session_id.clone();
    let session = state
        .db
        .call(move |db| db.get_session(&id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::Internal(format!("Session {} vanished", task.session_id)))?;
    Ok((StatusCode::ACCEPTED, Json(session)))
}

async fn receive_event(
    State(state): State<SharedState>,
    Json(event): Json<TriggerEvent>,
) -> Result<impl IntoResponse, ApiError> {
    start(&state, Trigger::from(event)).await
}

async fn manual_trigger(
    State(state): State<SharedState>,
    Json(req): Json<ManualTriggerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let command = WorkflowCommand::from_str(&req.command).map_err(ApiError::BadRequest)?;
    let instruction = req
        .instruction
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty());
    let trigger = Trigger::manual(req.repo, req.number, req.is_pull_request, command, instruction);
    start(&state, trigger).await
}

async fn list_sessions(
    State(state): State<SharedState>,
    Query(filter): Query<SessionFilter>,
) -> Result<Json<Vec<Session>>, ApiError> {
    let sessions = state
        .db
        .call(move |db| db.list_sessions(&filter))
        .await
        .map_err(internal)?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let lookup = id.clone();
    let session = state
        .db
        .call(move |db| db.get_session(&lookup))
        .await
        .map_err(internal)?;
    match session {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError::NotFound(format!("Session {} not found", id))),
    }
}

async fn get_scope(
    State(state): State<SharedState>,
    Path((owner, repo, number)): Path<(String, String, u64)>,
) -> Result<Json<Session>, ApiError> {
    let full = format!("{}/{}", owner, repo);
    let lookup = full.clone();
    let session = state
        .db
        .call(move |db| db.find_active_by_scope(&lookup, number))
        .await
        .map_err(internal)?;
    match session {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError::NotFound(format!(
            "No active session for {}#{}",
            full, number
        ))),
    }
}

async fn cancel_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.orchestrator.cancel(&id).await.map_err(internal)? {
        CancelOutcome::Cancelling => Ok((
            StatusCode::ACCEPTED,
            Json(CancelResponse {
                session_id: id,
                status: "cancelling",
            }),
        )),
        CancelOutcome::NotActive => Err(ApiError::Conflict(format!(
            "Session {} is not running in this process",
            id
        ))),
        CancelOutcome::NotFound => Err(ApiError::NotFound(format!("Session {} not found", id))),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
