use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

use super::error::ApiError;
use super::server::AppState;
use crate::core::{Provider, ServiceError, SessionState};
use crate::services::ListSessionsParams;
use crate::store::SessionPatch;

/// Body for `POST /sessions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Absolute path to the project directory.
    pub project_path: PathBuf,
    /// Agent provider for the session.
    pub provider: Provider,
}

/// Query parameters for `GET /sessions`.
#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    /// Filter on session state.
    pub state: Option<SessionState>,
    /// Page size.
    pub limit: Option<i64>,
    /// Page offset.
    pub offset: Option<i64>,
}

/// Body for `PATCH /sessions/{id}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionRequest {
    /// Replace the free-form context.
    pub context: Option<String>,
    /// Replace the free-form metadata.
    pub metadata: Option<serde_json::Value>,
}

/// Parse a path segment as a session id.
pub(super) fn parse_session_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| {
        ApiError(ServiceError::validation(format!("invalid session id: {id}")))
    })
}

/// `POST /sessions` — create a session. 201 on success.
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .create_session(request.project_path, request.provider)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "session": session }))))
}

/// `GET /sessions` — paginated listing.
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = state
        .sessions
        .list_sessions(ListSessionsParams {
            state: query.state,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    Ok(Json(json!({
        "sessions": page.sessions,
        "total": page.total,
        "limit": page.limit,
        "offset": page.offset,
    })))
}

/// `GET /sessions/{id}`.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_session_id(&id)?;
    let session = state.sessions.get_session(id).await?;
    Ok(Json(json!({ "session": session })))
}

/// `PATCH /sessions/{id}` — update `context`/`metadata`.
pub async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateSessionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_session_id(&id)?;
    let session = state
        .sessions
        .update_session(id, SessionPatch {
            context: request.context,
            metadata: request.metadata,
        })
        .await?;
    Ok(Json(json!({ "session": session })))
}

/// `DELETE /sessions/{id}`. 409 while a job is active.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_session_id(&id)?;
    state.sessions.delete_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
