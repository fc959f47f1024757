//! Process-local typed publish/subscribe for session-scoped events.
//!
//! Topics are keyed by session id. Fan-out is unbounded; each subscriber has
//! a bounded buffer. Publishing never blocks: a subscriber whose buffer would
//! overflow is dropped, with a `slow-consumer` error delivered as its final
//! event. Nothing is persisted; late subscribers catch up through the message
//! service's cursor API.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::SessionMessage;

/// Terminal status carried by a `session-done` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneStatus {
    /// The job completed normally.
    Completed,
    /// The job exhausted its attempts.
    Failed,
    /// The job was cancelled by the client.
    Cancelled,
}

impl DoneStatus {
    /// Wire tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// An event published under a session's topic.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A canonical message was appended to the session.
    MessageAppended(SessionMessage),
    /// The agent invoked a tool.
    ToolUse {
        /// Tool call id.
        tool_id: String,
        /// Tool name.
        name: String,
        /// Raw tool input.
        input: Value,
    },
    /// A tool invocation produced a result.
    ToolResult {
        /// Id of the tool_use this result answers.
        tool_use_id: String,
        /// Whether the tool reported failure.
        is_error: bool,
    },
    /// A runner or parse error, mirrored from the persisted error message.
    Error {
        /// Human-readable description.
        message: String,
    },
    /// The session's active job reached a terminal state.
    SessionDone {
        /// Terminal status.
        status: DoneStatus,
    },
    /// Final event delivered to a subscriber dropped for falling behind.
    SlowConsumer,
}

impl SessionEvent {
    /// Event kind tag used as the SSE event name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MessageAppended(_) => "message-appended",
            Self::ToolUse { .. } => "tool-use",
            Self::ToolResult { .. } => "tool-result",
            Self::Error { .. } => "error",
            Self::SessionDone { .. } => "session-done",
            Self::SlowConsumer => "slow-consumer",
        }
    }

    /// Ordinal of the underlying message, for SSE frame ids.
    #[must_use]
    pub const fn ordinal(&self) -> Option<i64> {
        match self {
            Self::MessageAppended(message) => Some(message.ordinal),
            _ => None,
        }
    }

    /// JSON payload serialized into the SSE data field.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::MessageAppended(message) => {
                serde_json::to_value(message).unwrap_or(Value::Null)
            }
            Self::ToolUse {
                tool_id,
                name,
                input,
            } => serde_json::json!({"toolId": tool_id, "name": name, "input": input}),
            Self::ToolResult {
                tool_use_id,
                is_error,
            } => serde_json::json!({"toolUseId": tool_use_id, "isError": is_error}),
            Self::Error { message } => serde_json::json!({"message": message}),
            Self::SessionDone { status } => serde_json::json!({"status": status}),
            Self::SlowConsumer => serde_json::json!({"error": "slow-consumer"}),
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SessionEvent>,
}

/// A live subscription to one session's topic.
///
/// Dropping the subscription unsubscribes; the bus prunes the sender on the
/// next publish to that topic.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<SessionEvent>,
}

impl Subscription {
    /// Receive the next event; `None` once the topic is closed or this
    /// subscriber was dropped after a `SlowConsumer` event.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

/// Process-local event bus with per-session topics.
#[derive(Debug)]
pub struct EventBus {
    /// Per-subscriber buffer capacity (`sseBufferEvents`).
    capacity: usize,
    topics: Mutex<HashMap<Uuid, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe to a session's topic. Only events published after this call
    /// are delivered.
    pub fn subscribe(&self, session_id: Uuid) -> Subscription {
        // One extra slot is reserved so the slow-consumer error can always
        // be delivered as the final event before the drop.
        let (tx, rx) = mpsc::channel(self.capacity + 1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        topics.entry(session_id).or_default().push(Subscriber { id, tx });
        drop(topics);
        tracing::debug!(session_id = %session_id, subscriber = id, "bus subscribe");
        Subscription { rx }
    }

    /// Publish an event to every live subscriber of the session's topic.
    ///
    /// Never blocks. Subscribers that cannot keep up are dropped after a
    /// final `SlowConsumer` event.
    pub fn publish(&self, session_id: Uuid, event: &SessionEvent) {
        let mut topics = self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(subscribers) = topics.get_mut(&session_id) else {
            return;
        };

        subscribers.retain(|subscriber| {
            if subscriber.tx.is_closed() {
                return false;
            }
            // capacity() is the number of free slots; the last one is
            // reserved for the slow-consumer notice.
            if subscriber.tx.capacity() > 1 {
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(_) => false,
                }
            } else {
                tracing::warn!(
                    session_id = %session_id,
                    subscriber = subscriber.id,
                    "dropping slow event bus subscriber"
                );
                let _ = subscriber.tx.try_send(SessionEvent::SlowConsumer);
                false
            }
        });

        if subscribers.is_empty() {
            topics.remove(&session_id);
        }
    }

    /// Number of live subscribers on a topic (diagnostics).
    #[must_use]
    pub fn subscriber_count(&self, session_id: Uuid) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&session_id)
            .map_or(0, Vec::len)
    }
}
