//! SSE bridge behavior over a real listening server: hello snapshot,
//! catch-up in ordinal order, live events, terminal done frame.

mod common;

use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use common::{TestBackend, backend};
use pokecode::api::{AppState, create_router};
use pokecode::bus::{DoneStatus, SessionEvent};
use pokecode::config::Config;
use pokecode::core::Provider;

/// One parsed SSE frame.
#[derive(Debug)]
struct Frame {
    event: Option<String>,
    data: String,
}

/// Incremental SSE frame reader over a reqwest byte stream.
struct FrameReader {
    stream: std::pin::Pin<
        Box<dyn futures::Stream<Item = Result<axum::body::Bytes, reqwest::Error>> + Send>,
    >,
    buffer: String,
}

impl FrameReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            stream: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        }
    }

    /// Next non-comment frame, or `None` when the stream closes.
    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let raw = self.buffer[..end].to_owned();
                self.buffer.drain(..end + 2);

                let mut event = None;
                let mut data = String::new();
                for line in raw.lines() {
                    if let Some(rest) = line.strip_prefix("event: ") {
                        event = Some(rest.to_owned());
                    } else if let Some(rest) = line.strip_prefix("data: ") {
                        data.push_str(rest);
                    }
                }
                // Comment-only frames are keep-alive heartbeats.
                if event.is_none() && data.is_empty() {
                    continue;
                }
                return Some(Frame { event, data });
            }

            let chunk = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .expect("SSE stream stalled")?;
            let chunk = chunk.expect("SSE stream errored");
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
}

/// Bind the router on an ephemeral port and return its base URL.
async fn spawn_server(b: &TestBackend) -> String {
    let router = create_router(AppState {
        sessions: Arc::clone(&b.sessions),
        messages: Arc::clone(&b.messages),
        queue: Arc::clone(&b.queue),
        bus: Arc::clone(&b.bus),
        config: Arc::new(Config::default()),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_stream_replays_history_then_goes_live() {
    let b = backend().await;
    let session = b.create_session(Provider::ClaudeCode).await;

    // History present before the client connects.
    b.messages.save_user_message(session.id, "first").await.unwrap();
    b.messages.save_user_message(session.id, "second").await.unwrap();

    let base = spawn_server(&b).await;
    let response = reqwest::get(format!("{base}/sessions/{id}/stream", id = session.id))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let mut frames = FrameReader::new(response);

    let hello = frames.next_frame().await.unwrap();
    assert_eq!(hello.event.as_deref(), Some("hello"));
    let snapshot: Value = serde_json::from_str(&hello.data).unwrap();
    assert_eq!(snapshot["id"], session.id.to_string());

    // Catch-up in ordinal order.
    let first = frames.next_frame().await.unwrap();
    assert_eq!(first.event.as_deref(), Some("message-appended"));
    let first_data: Value = serde_json::from_str(&first.data).unwrap();
    assert_eq!(first_data["ordinal"], 1);

    let second = frames.next_frame().await.unwrap();
    let second_data: Value = serde_json::from_str(&second.data).unwrap();
    assert_eq!(second_data["ordinal"], 2);

    // A message appended after connect arrives live, no duplicates.
    b.messages.save_user_message(session.id, "third").await.unwrap();
    let third = frames.next_frame().await.unwrap();
    assert_eq!(third.event.as_deref(), Some("message-appended"));
    let third_data: Value = serde_json::from_str(&third.data).unwrap();
    assert_eq!(third_data["ordinal"], 3);

    // The terminal event closes the stream with a final done frame.
    b.bus.publish(session.id, &SessionEvent::SessionDone {
        status: DoneStatus::Completed,
    });
    let done_frame = frames.next_frame().await.unwrap();
    assert_eq!(done_frame.event.as_deref(), Some("session-done"));
    let final_frame = frames.next_frame().await.unwrap();
    assert_eq!(final_frame.event.as_deref(), Some("done"));
    let payload: Value = serde_json::from_str(&final_frame.data).unwrap();
    assert_eq!(payload["status"], "completed");

    assert!(frames.next_frame().await.is_none(), "stream should close after done");
}

#[tokio::test]
async fn test_stream_tool_events_carry_payloads() {
    let b = backend().await;
    let session = b.create_session(Provider::ClaudeCode).await;

    let base = spawn_server(&b).await;
    let response = reqwest::get(format!("{base}/sessions/{id}/stream", id = session.id))
        .await
        .unwrap();
    let mut frames = FrameReader::new(response);
    assert_eq!(frames.next_frame().await.unwrap().event.as_deref(), Some("hello"));

    // An assistant envelope with a tool_use block publishes both frames.
    b.messages
        .save_sdk_message(pokecode::services::SaveSdkMessage {
            session_id: session.id,
            sdk_message: serde_json::json!({
                "type": "assistant",
                "session_id": "prov",
                "content": [{"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {"command": "ls"}}]
            }),
            provider_session_id: None,
            provider: Provider::ClaudeCode,
        })
        .await
        .unwrap();

    let appended = frames.next_frame().await.unwrap();
    assert_eq!(appended.event.as_deref(), Some("message-appended"));

    let tool_use = frames.next_frame().await.unwrap();
    assert_eq!(tool_use.event.as_deref(), Some("tool-use"));
    let payload: Value = serde_json::from_str(&tool_use.data).unwrap();
    assert_eq!(payload["toolId"], "tu_1");
    assert_eq!(payload["name"], "Bash");
}
