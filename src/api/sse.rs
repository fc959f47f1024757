//! Server-sent-event bridge.
//!
//! Fuses a catch-up read with a live bus subscription to deliver a gap-free
//! stream: the bridge subscribes *before* the catch-up query and dedupes the
//! brief overlap window by message id.

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use axum::response::sse::KeepAliveStream;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::error::ApiError;
use super::server::AppState;
use super::sessions::parse_session_id;
use crate::bus::{SessionEvent, Subscription};
use crate::core::{ServiceResult, SessionMessage};
use crate::services::GetMessagesParams;

/// Heartbeat interval for `:keep-alive` comments.
const KEEP_ALIVE_SECS: u64 = 25;

/// Frames buffered between the bridge task and the HTTP writer.
const FRAME_BUFFER: usize = 16;

/// `GET /sessions/{id}/stream`.
pub async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<KeepAliveStream<ReceiverStream<Result<Event, Infallible>>>>, ApiError> {
    let session_id = parse_session_id(&id)?;
    let session = state.sessions.get_session(session_id).await?;

    // Subscribe before the catch-up read so nothing published in between is
    // lost; duplicates from the overlap are filtered by message id below.
    let subscription = state.bus.subscribe(session_id);
    let catch_up = load_history(&state, session_id).await?;

    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    let hello = Event::default()
        .event("hello")
        .data(serde_json::to_string(&session).unwrap_or_else(|_| "{}".to_owned()));

    tokio::spawn(async move {
        if tx.send(Ok(hello)).await.is_err() {
            return;
        }
        forward_events(tx, catch_up, subscription).await;
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEP_ALIVE_SECS))
            .text("keep-alive"),
    ))
}

/// Read the full message history in cursor order.
async fn load_history(state: &AppState, session_id: Uuid) -> ServiceResult<Vec<SessionMessage>> {
    let mut messages = Vec::new();
    let mut after = None;
    loop {
        let page = state
            .messages
            .get_messages(GetMessagesParams {
                session_id,
                after,
                limit: Some(1000),
            })
            .await?;
        let has_next = page.pagination.has_next_page;
        after = page.pagination.next_cursor;
        messages.extend(page.messages);
        if !has_next {
            break;
        }
    }
    Ok(messages)
}

/// Emit catch-up frames, then live frames until the session is done or the
/// client goes away.
async fn forward_events(
    tx: mpsc::Sender<Result<Event, Infallible>>,
    catch_up: Vec<SessionMessage>,
    mut subscription: Subscription,
) {
    let mut seen: HashSet<Uuid> = HashSet::new();
    for message in catch_up {
        seen.insert(message.id);
        let frame = message_frame(&message);
        if tx.send(Ok(frame)).await.is_err() {
            return;
        }
    }

    while let Some(event) = subscription.recv().await {
        // Drop events already delivered during the catch-up overlap.
        if let SessionEvent::MessageAppended(message) = &event {
            if seen.remove(&message.id) {
                continue;
            }
        }

        let mut frame = Event::default().event(event.kind()).data(
            serde_json::to_string(&event.payload()).unwrap_or_else(|_| "{}".to_owned()),
        );
        if let Some(ordinal) = event.ordinal() {
            frame = frame.id(ordinal.to_string());
        }
        if tx.send(Ok(frame)).await.is_err() {
            return;
        }

        match event {
            SessionEvent::SessionDone { status } => {
                let done = Event::default().event("done").data(
                    serde_json::to_string(&serde_json::json!({"status": status}))
                        .unwrap_or_else(|_| "{}".to_owned()),
                );
                let _ = tx.send(Ok(done)).await;
                return;
            }
            SessionEvent::SlowConsumer => return,
            _ => {}
        }
    }
}

/// Serialize one canonical message as a `message-appended` frame.
fn message_frame(message: &SessionMessage) -> Event {
    Event::default()
        .event("message-appended")
        .id(message.ordinal.to_string())
        .data(serde_json::to_string(message).unwrap_or_else(|_| "{}".to_owned()))
}
