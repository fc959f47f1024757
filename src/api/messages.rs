use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::error::ApiError;
use super::server::AppState;
use super::sessions::parse_session_id;
use crate::core::{JobData, ServiceError};
use crate::services::{EnqueueJob, GetMessagesParams};

/// Body for `POST /sessions/{id}/messages`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    /// The prompt text.
    pub content: String,
    /// Model flag forwarded to the agent.
    pub model: Option<String>,
    /// Tools the agent may use without prompting.
    pub allowed_tools: Option<Vec<String>>,
}

/// Query parameters for `GET /sessions/{id}/messages`.
#[derive(Debug, Deserialize)]
pub struct GetMessagesQuery {
    /// Cursor: id of the last message of the previous page.
    pub after: Option<Uuid>,
    /// Page size.
    pub limit: Option<i64>,
}

/// `POST /sessions/{id}/messages` — append the user message and enqueue the
/// prompt job. 202 Accepted; 409 while another job is active.
pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PostMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = parse_session_id(&id)?;
    if request.content.trim().is_empty() {
        return Err(ApiError(ServiceError::validation("content must not be empty")));
    }

    let session = state.sessions.get_session(session_id).await?;
    // Fail fast before appending the user message; the database's unique
    // active-job index backs this up against racing writers.
    if state.queue.has_active_jobs(session_id).await? {
        return Err(ApiError(ServiceError::conflict(
            "a prompt is already in progress",
        )));
    }

    let message = state
        .messages
        .save_user_message(session_id, &request.content)
        .await?;

    let prompt_id = Uuid::new_v4().to_string();
    let job = state
        .queue
        .enqueue(EnqueueJob {
            session_id,
            provider: session.provider,
            prompt_id: prompt_id.clone(),
            data: JobData {
                project_path: session.project_path.clone(),
                prompt: request.content,
                model: request.model,
                allowed_tools: request.allowed_tools,
            },
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": message,
            "jobId": job.id,
            "promptId": prompt_id,
        })),
    ))
}

/// `GET /sessions/{id}/messages` — cursor-paginated, ascending by ordinal.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<GetMessagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = parse_session_id(&id)?;
    let page = state
        .messages
        .get_messages(GetMessagesParams {
            session_id,
            after: query.after,
            limit: query.limit,
        })
        .await?;
    Ok(Json(json!({
        "messages": page.messages,
        "session": page.session,
        "pagination": page.pagination,
    })))
}

/// `GET /sessions/{id}/messages/raw` — raw envelopes in ordinal order.
pub async fn get_raw_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = parse_session_id(&id)?;
    let envelopes = state.messages.get_raw_messages(session_id).await?;
    Ok(Json(json!({ "messages": envelopes })))
}

/// `POST /sessions/{id}/cancel` — cancel active and pending jobs.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = parse_session_id(&id)?;
    state.sessions.get_session(session_id).await?;
    let cancelled = state.queue.cancel_session_jobs(session_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "cancelled": cancelled.len() })),
    ))
}
