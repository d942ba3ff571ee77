use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::remote::{RemoteRequest, RemoteStore};
use crate::sync::{SessionManager, SyncError, SyncRequest};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub store: Arc<dyn RemoteStore>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", get(get_status))
        .route("/sessions/:id/start", post(start_sync))
        .route("/sessions/:id/remote", post(start_remote))
        .route("/sessions/:id/cancel", post(cancel_sync))
        .route("/sessions/:id/ack", post(acknowledge))
        .route("/sessions/:id/login", post(login))
        .route("/sessions/:id/logs", get(get_logs))
}

/// Maps engine errors onto HTTP status codes.
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::UnknownSession(_) => StatusCode::NOT_FOUND,
            SyncError::AlreadyRunning(_) | SyncError::NotIdle(_) => StatusCode::CONFLICT,
            SyncError::NotAuthenticated(_) | SyncError::Remote(_) => StatusCode::UNAUTHORIZED,
            SyncError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

#[derive(Deserialize)]
struct CreateSession {
    id: Option<String>,
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions: Vec<_> = state.sessions.list().iter().map(|s| s.status()).collect();
    Json(json!({ "sessions": sessions }))
}

async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSession>>,
) -> Json<serde_json::Value> {
    let id = body.and_then(|Json(b)| b.id);
    let session = state.sessions.create(id);
    Json(json!({ "id": session.id(), "state": session.state() }))
}

async fn get_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = state.sessions.get(&id)?;
    Ok(Json(json!(session.status())))
}

async fn start_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SyncRequest>,
) -> ApiResult {
    state.sessions.start(&id, request)?;
    Ok(Json(json!({ "status": "started" })))
}

async fn start_remote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RemoteRequest>,
) -> ApiResult {
    state.sessions.start_remote(&id, request)?;
    Ok(Json(json!({ "status": "started" })))
}

async fn cancel_sync(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = state.sessions.get(&id)?;
    let cancelled = session.cancel();
    Ok(Json(json!({ "status": if cancelled { "cancelling" } else { "not running" } })))
}

async fn acknowledge(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = state.sessions.get(&id)?;
    session.acknowledge()?;
    Ok(Json(json!({ "state": session.state() })))
}

async fn login(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let session = state.sessions.get(&id)?;
    let store = state.store.clone();
    // Authentication may block on the network.
    let outcome = tokio::task::spawn_blocking(move || session.login(store.as_ref()))
        .await
        .map_err(|e| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    outcome?;
    Ok(Json(json!({ "status": "logged in" })))
}

async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult {
    let session = state.sessions.get(&id)?;
    Ok(Json(json!({ "logs": session.logs(query.limit) })))
}
