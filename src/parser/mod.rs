//! Normalizes raw agent SDK messages into canonical message records.
//!
//! Parsing never fails: unknown shapes are preserved verbatim in the stored
//! envelope, and malformed envelopes degrade to a synthetic `error` record so
//! the session history stays self-describing.

/// Typed envelope views.
pub mod envelope;

use serde_json::Value;

use crate::core::MessageType;
use envelope::{ContentBlock, SdkEnvelope, TokenUsage};

/// A tool lifecycle event extracted from content blocks, published on the
/// event bus alongside the appended message.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    /// The agent invoked a tool.
    Use {
        /// Tool call id (`content.id`).
        tool_id: String,
        /// Tool name.
        name: String,
        /// Raw tool input, passed through without structural validation.
        input: Value,
    },
    /// A tool invocation produced a result.
    Result {
        /// Id of the tool_use this result answers.
        tool_use_id: String,
        /// Whether the tool reported failure.
        is_error: bool,
    },
}

/// Everything the message service extracts from one raw SDK message.
#[derive(Debug)]
pub struct ParsedSdkMessage {
    /// Normalized message type.
    pub message_type: MessageType,
    /// Link from a tool_result back to its tool_use, when present.
    pub parent_tool_use_id: Option<String>,
    /// The agent's internal session handle, when the envelope carried one.
    pub provider_session_id: Option<String>,
    /// Tokens to add to the session counter.
    pub token_delta: i64,
    /// Concatenated text blocks surfaced to clients.
    pub display_text: Option<String>,
    /// Tool events to publish.
    pub tool_events: Vec<ToolEvent>,
    /// True when the envelope was missing required fields and the record
    /// was degraded to a synthetic error.
    pub malformed: bool,
}

/// Parse one raw SDK message.
///
/// The raw value is persisted verbatim by the caller; this function only
/// decides the normalized type and the extracted side effects.
#[must_use]
pub fn parse_sdk_message(raw: &Value) -> ParsedSdkMessage {
    let Some(object) = raw.as_object() else {
        tracing::warn!("malformed agent envelope: not a JSON object");
        return malformed();
    };
    if !object.contains_key("type") {
        tracing::warn!("malformed agent envelope: missing type field");
        return malformed();
    }
    // Synthetic error envelopes (runner failures) normalize directly.
    if object.get("type").and_then(Value::as_str) == Some("error") {
        return ParsedSdkMessage {
            message_type: MessageType::Error,
            parent_tool_use_id: None,
            provider_session_id: object
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_owned),
            token_delta: 0,
            display_text: object
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned),
            tool_events: Vec::new(),
            malformed: false,
        };
    }

    match serde_json::from_value::<SdkEnvelope>(raw.clone()) {
        Ok(SdkEnvelope::System(system)) => ParsedSdkMessage {
            message_type: MessageType::System,
            parent_tool_use_id: None,
            provider_session_id: system.session_id,
            token_delta: 0,
            display_text: None,
            tool_events: Vec::new(),
            malformed: false,
        },
        Ok(SdkEnvelope::User(user)) => {
            let (parent, events) = tool_results(user.blocks());
            ParsedSdkMessage {
                message_type: MessageType::User,
                parent_tool_use_id: parent,
                provider_session_id: user.session_id,
                token_delta: 0,
                display_text: None,
                tool_events: events,
                malformed: false,
            }
        }
        Ok(SdkEnvelope::Assistant(assistant)) => {
            let display_text = display_text(assistant.blocks());
            let tool_events = tool_uses(assistant.blocks());
            ParsedSdkMessage {
                message_type: MessageType::Assistant,
                parent_tool_use_id: None,
                provider_session_id: assistant.session_id.clone(),
                token_delta: assistant.token_usage().as_ref().map_or(0, TokenUsage::total),
                display_text,
                tool_events,
                malformed: false,
            }
        }
        Ok(SdkEnvelope::Result(result)) => ParsedSdkMessage {
            message_type: MessageType::Result,
            parent_tool_use_id: None,
            provider_session_id: result.session_id.clone(),
            token_delta: result.usage.as_ref().map_or(0, TokenUsage::total),
            display_text: None,
            tool_events: Vec::new(),
            malformed: false,
        },
        // Unrecognized top-level type: keep the envelope verbatim under the
        // envelope's role, with no extracted side effects.
        Err(_) => {
            let message_type = match object.get("role").and_then(Value::as_str) {
                Some("user") => MessageType::User,
                _ => MessageType::Assistant,
            };
            tracing::debug!(
                envelope_type = object.get("type").and_then(|v| v.as_str()),
                "unrecognized agent envelope type, preserving verbatim"
            );
            ParsedSdkMessage {
                message_type,
                parent_tool_use_id: None,
                provider_session_id: object
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                token_delta: 0,
                display_text: None,
                tool_events: Vec::new(),
                malformed: false,
            }
        }
    }
}

fn malformed() -> ParsedSdkMessage {
    ParsedSdkMessage {
        message_type: MessageType::Error,
        parent_tool_use_id: None,
        provider_session_id: None,
        token_delta: 0,
        display_text: None,
        tool_events: Vec::new(),
        malformed: true,
    }
}

/// Concatenate `text` blocks into the client-facing display text.
fn display_text(blocks: &[ContentBlock]) -> Option<String> {
    let mut parts = Vec::new();
    for block in blocks {
        if let ContentBlock::Text { text } = block {
            parts.push(text.as_str());
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Extract tool_use events from assistant content blocks.
fn tool_uses(blocks: &[ContentBlock]) -> Vec<ToolEvent> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input }
            | ContentBlock::ServerToolUse { id, name, input } => Some(ToolEvent::Use {
                tool_id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Extract tool_result events from user content blocks; the first result's
/// id becomes the message's `parent_tool_use_id`.
fn tool_results(blocks: &[ContentBlock]) -> (Option<String>, Vec<ToolEvent>) {
    let mut parent = None;
    let mut events = Vec::new();
    for block in blocks {
        if let ContentBlock::ToolResult {
            tool_use_id,
            is_error,
            ..
        } = block
        {
            if parent.is_none() {
                parent = Some(tool_use_id.clone());
            }
            events.push(ToolEvent::Result {
                tool_use_id: tool_use_id.clone(),
                is_error: is_error.unwrap_or(false),
            });
        }
    }
    (parent, events)
}
