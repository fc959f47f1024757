//! Typed views over raw agent SDK envelopes.
//!
//! Each envelope is a JSON object with at least `type` and `session_id`.
//! Deserialization here is a *view*: the raw value is persisted verbatim
//! elsewhere, so these types only name the fields the core extracts and
//! ignore everything else.

use serde::Deserialize;
use serde_json::Value;

/// Top-level message from an agent's stream-json output.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SdkEnvelope {
    /// Session initialization notification.
    System(SystemEnvelope),
    /// User-role envelope; carries tool results during a run.
    User(UserEnvelope),
    /// Agent response envelope.
    Assistant(AssistantEnvelope),
    /// Final outcome of a run.
    Result(ResultEnvelope),
}

/// `system` envelope. `subtype` is `init` on session start.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemEnvelope {
    /// Notification subtype.
    #[serde(default)]
    pub subtype: Option<String>,
    /// The agent's internal session handle.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Working directory reported by the agent.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Available tool names.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Model in use.
    #[serde(default)]
    pub model: Option<String>,
}

/// `user` envelope. Content is either plain text or tool_result blocks.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEnvelope {
    /// The agent's internal session handle.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Nested API message, when the SDK wraps one.
    #[serde(default)]
    pub message: Option<InnerMessage>,
    /// Inline content, when the SDK does not wrap.
    #[serde(default)]
    pub content: Option<EnvelopeContent>,
}

/// `assistant` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEnvelope {
    /// The agent's internal session handle.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Nested API message, when the SDK wraps one.
    #[serde(default)]
    pub message: Option<InnerMessage>,
    /// Inline content, when the SDK does not wrap.
    #[serde(default)]
    pub content: Option<EnvelopeContent>,
    /// Usage reported at the envelope level.
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// `result` envelope: final outcome of one run.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultEnvelope {
    /// Outcome subtype (`success`, `error_max_turns`, ...).
    #[serde(default)]
    pub subtype: Option<String>,
    /// The agent's internal session handle.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Wall-clock duration of the run.
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Whether the run ended in error.
    #[serde(default)]
    pub is_error: Option<bool>,
    /// Number of API turns taken.
    #[serde(default)]
    pub num_turns: Option<u32>,
    /// Total cost reported by the agent.
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    /// Final token usage.
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// The API message nested inside `user`/`assistant` envelopes.
#[derive(Debug, Clone, Deserialize)]
pub struct InnerMessage {
    /// Content blocks or plain text.
    #[serde(default)]
    pub content: Option<EnvelopeContent>,
    /// Token usage carried on the message.
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// Message content: a plain string or a list of typed blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvelopeContent {
    /// Plain text content.
    Text(String),
    /// Structured content blocks.
    Blocks(Vec<ContentBlock>),
}

/// A single content block. Unknown block types deserialize to `Other` and
/// carry no extracted side effects; the raw envelope keeps them verbatim.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text contributing to the display text surfaced to clients.
    Text {
        /// The text itself.
        text: String,
    },
    /// Tool invocation request.
    ToolUse {
        /// Tool call id, referenced by the matching tool_result.
        id: String,
        /// Tool name.
        name: String,
        /// Raw tool input; never structurally validated here.
        #[serde(default)]
        input: Value,
    },
    /// Tool invocation outcome (appears in user-role envelopes).
    ToolResult {
        /// Id of the tool_use this result answers.
        tool_use_id: String,
        /// Result payload.
        #[serde(default)]
        content: Option<Value>,
        /// Whether the tool failed.
        #[serde(default)]
        is_error: Option<bool>,
    },
    /// Extended thinking block.
    Thinking {
        /// The thinking text.
        #[serde(default)]
        thinking: String,
    },
    /// Redacted thinking block.
    RedactedThinking {},
    /// Server-side (MCP) tool invocation.
    ServerToolUse {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
        /// Raw tool input.
        #[serde(default)]
        input: Value,
    },
    /// Server-side web search result block.
    WebSearchToolResult {
        /// Id of the server tool_use this result answers.
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    /// Any block type this backend does not recognize.
    #[serde(other)]
    Other,
}

/// Token counters carried on assistant/result envelopes.
///
/// `cache_creation_input_tokens` may be absent or null; both count as zero.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens read from the prompt cache.
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    /// Tokens written to the prompt cache.
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u64>,
}

impl TokenUsage {
    /// Total tokens added to the session counter.
    #[must_use]
    pub fn total(&self) -> i64 {
        let total = self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens.unwrap_or(0);
        i64::try_from(total).unwrap_or(i64::MAX)
    }
}

impl UserEnvelope {
    /// Content blocks regardless of nesting shape.
    #[must_use]
    pub fn blocks(&self) -> &[ContentBlock] {
        content_blocks(self.content.as_ref(), self.message.as_ref())
    }
}

impl AssistantEnvelope {
    /// Content blocks regardless of nesting shape.
    #[must_use]
    pub fn blocks(&self) -> &[ContentBlock] {
        content_blocks(self.content.as_ref(), self.message.as_ref())
    }

    /// Usage from the envelope or the nested message.
    #[must_use]
    pub fn token_usage(&self) -> Option<TokenUsage> {
        self.usage
            .or_else(|| self.message.as_ref().and_then(|m| m.usage))
    }
}

fn content_blocks<'a>(
    inline: Option<&'a EnvelopeContent>,
    nested: Option<&'a InnerMessage>,
) -> &'a [ContentBlock] {
    let content = inline.or_else(|| nested.and_then(|m| m.content.as_ref()));
    match content {
        Some(EnvelopeContent::Blocks(blocks)) => blocks,
        _ => &[],
    }
}
