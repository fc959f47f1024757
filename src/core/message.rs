use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalized type of a canonical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A prompt posted by the client.
    User,

    /// Agent output (text, tool use, thinking).
    Assistant,

    /// Agent init/system notification.
    System,

    /// Final outcome of a run.
    Result,

    /// Synthetic error record (runner failure, malformed envelope).
    Error,
}

impl MessageType {
    /// Tag persisted in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            _ => anyhow::bail!("unknown message type: {s}"),
        }
    }
}

/// The canonical on-disk message. Append-only: once inserted, no field is
/// ever mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    /// Unique identifier, always generated by this backend (never by the
    /// agent SDK).
    pub id: Uuid,

    /// Owning session.
    pub session_id: Uuid,

    /// Per-session strictly increasing insertion order. Gaps appear only
    /// when an insert rolls back.
    pub ordinal: i64,

    /// Normalized message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// Links a tool_result back to its tool_use.
    pub parent_tool_use_id: Option<String>,

    /// The raw agent envelope, preserved verbatim for faithful
    /// re-serialization.
    pub content_data: serde_json::Value,

    /// The agent's internal session handle, when the envelope carried one.
    pub provider_session_id: Option<String>,

    /// Insertion time.
    pub created_at: DateTime<Utc>,
}
