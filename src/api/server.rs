use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bus::EventBus;
use crate::config::Config;
use crate::services::{MessageService, QueueService, SessionService};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session lifecycle operations.
    pub sessions: Arc<SessionService>,
    /// Message append/read operations.
    pub messages: Arc<MessageService>,
    /// Job queue operations.
    pub queue: Arc<QueueService>,
    /// Event bus feeding the SSE bridge.
    pub bus: Arc<EventBus>,
    /// Effective configuration.
    pub config: Arc<Config>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Build the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route(
            "/sessions",
            get(super::sessions::list_sessions).post(super::sessions::create_session),
        )
        .route(
            "/sessions/{id}",
            get(super::sessions::get_session)
                .patch(super::sessions::update_session)
                .delete(super::sessions::delete_session),
        )
        .route(
            "/sessions/{id}/messages",
            get(super::messages::get_messages).post(super::messages::post_message),
        )
        .route(
            "/sessions/{id}/messages/raw",
            get(super::messages::get_raw_messages),
        )
        .route("/sessions/{id}/cancel", post(super::messages::cancel_session))
        .route("/sessions/{id}/stream", get(super::sse::stream_session))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Bind and serve until the shutdown token fires.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!(host, port, "http server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
