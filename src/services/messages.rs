use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::bus::{EventBus, SessionEvent};
use crate::core::{MessageType, Provider, ServiceResult, Session, SessionMessage};
use crate::parser::{ToolEvent, parse_sdk_message};
use crate::store::{NewMessage, Store};

/// Default page size for message reads.
const DEFAULT_PAGE_LIMIT: i64 = 100;
/// Maximum page size for message reads.
const MAX_PAGE_LIMIT: i64 = 1000;

/// Input for [`MessageService::save_sdk_message`].
#[derive(Debug)]
pub struct SaveSdkMessage {
    /// Owning session.
    pub session_id: Uuid,
    /// The raw envelope as received from the agent.
    pub sdk_message: Value,
    /// Session handle reported out-of-band by the runner, if any.
    pub provider_session_id: Option<String>,
    /// Provider that produced the envelope.
    pub provider: Provider,
}

/// Parameters for [`MessageService::get_messages`].
#[derive(Debug, Default, Clone)]
pub struct GetMessagesParams {
    /// Owning session.
    pub session_id: Uuid,
    /// Cursor: id of the last message of the previous page.
    pub after: Option<Uuid>,
    /// Page size, clamped to `1..=1000`; defaults to 100.
    pub limit: Option<i64>,
}

/// Cursor pagination state returned with each page.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// True iff more rows exist beyond this window.
    pub has_next_page: bool,
    /// Id of the last returned message; `None` on an empty page.
    pub next_cursor: Option<Uuid>,
}

/// One page of messages plus the owning session snapshot.
#[derive(Debug)]
pub struct MessagePage {
    /// Messages in ascending ordinal order.
    pub messages: Vec<SessionMessage>,
    /// Session snapshot taken with the page.
    pub session: Session,
    /// Cursor state.
    pub pagination: Pagination,
}

/// Append/read messages; the sole writer of `session_messages`.
pub struct MessageService {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    persist_system_messages: bool,
}

impl std::fmt::Debug for MessageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageService")
            .field("persist_system_messages", &self.persist_system_messages)
            .finish_non_exhaustive()
    }
}

impl MessageService {
    /// Create the service.
    #[must_use]
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, persist_system_messages: bool) -> Self {
        Self {
            store,
            bus,
            persist_system_messages,
        }
    }

    /// Append a user prompt. Increments `message_count`, stamps
    /// `last_message_sent_at`, and publishes `message-appended`.
    #[instrument(skip(self, content), fields(session_id = %session_id))]
    pub async fn save_user_message(
        &self,
        session_id: Uuid,
        content: &str,
    ) -> ServiceResult<SessionMessage> {
        // Ensure the session exists so absence surfaces as NotFound rather
        // than a silent no-op append.
        self.store.get_session(session_id).await?;

        let envelope = serde_json::json!({
            "type": "user",
            "role": "user",
            "content": content,
        });
        let message = self
            .store
            .append_message(NewMessage {
                session_id,
                message_type: MessageType::User,
                parent_tool_use_id: None,
                content_data: envelope,
                provider_session_id: None,
                token_delta: 0,
                is_user_prompt: true,
            })
            .await?;

        self.bus
            .publish(session_id, &SessionEvent::MessageAppended(message.clone()));
        Ok(message)
    }

    /// Parse and append one raw SDK message.
    ///
    /// The envelope is persisted verbatim; counters are updated in the same
    /// transaction as the insert. Returns `None` when the envelope is a
    /// `system` message and system persistence is disabled.
    #[instrument(skip(self, input), fields(session_id = %input.session_id, provider = %input.provider))]
    pub async fn save_sdk_message(
        &self,
        input: SaveSdkMessage,
    ) -> ServiceResult<Option<SessionMessage>> {
        let parsed = parse_sdk_message(&input.sdk_message);

        let provider_session_id = input
            .provider_session_id
            .clone()
            .or_else(|| parsed.provider_session_id.clone());

        // Back-fill before any skip decision: a run whose only envelope is
        // the init notification must still record its session handle.
        if let Some(psid) = &provider_session_id {
            if let Some(existing) = self
                .store
                .backfill_provider_session_id(input.session_id, psid)
                .await?
            {
                tracing::warn!(
                    session_id = %input.session_id,
                    existing = %existing,
                    reported = %psid,
                    "agent reported a different provider session id, keeping the first"
                );
            }
        }

        if parsed.message_type == MessageType::System && !self.persist_system_messages {
            tracing::debug!(session_id = %input.session_id, "skipping system envelope");
            return Ok(None);
        }

        let message = self
            .store
            .append_message(NewMessage {
                session_id: input.session_id,
                message_type: parsed.message_type,
                parent_tool_use_id: parsed.parent_tool_use_id.clone(),
                content_data: input.sdk_message,
                provider_session_id,
                token_delta: parsed.token_delta,
                is_user_prompt: false,
            })
            .await?;

        self.bus
            .publish(input.session_id, &SessionEvent::MessageAppended(message.clone()));
        for event in parsed.tool_events {
            let bus_event = match event {
                ToolEvent::Use {
                    tool_id,
                    name,
                    input,
                } => SessionEvent::ToolUse {
                    tool_id,
                    name,
                    input,
                },
                ToolEvent::Result {
                    tool_use_id,
                    is_error,
                } => SessionEvent::ToolResult {
                    tool_use_id,
                    is_error,
                },
            };
            self.bus.publish(input.session_id, &bus_event);
        }

        Ok(Some(message))
    }

    /// Append a synthetic error record and publish both the message and an
    /// `error` event, so history stays self-describing even when the client
    /// missed the live stream.
    #[instrument(skip(self, description), fields(session_id = %session_id))]
    pub async fn save_error_message(
        &self,
        session_id: Uuid,
        description: &str,
    ) -> ServiceResult<SessionMessage> {
        let envelope = serde_json::json!({
            "type": "error",
            "message": description,
        });
        let message = self
            .store
            .append_message(NewMessage {
                session_id,
                message_type: MessageType::Error,
                parent_tool_use_id: None,
                content_data: envelope,
                provider_session_id: None,
                token_delta: 0,
                is_user_prompt: false,
            })
            .await?;

        self.bus
            .publish(session_id, &SessionEvent::MessageAppended(message.clone()));
        self.bus.publish(session_id, &SessionEvent::Error {
            message: description.to_owned(),
        });
        Ok(message)
    }

    /// Cursor-paginated read, ascending by ordinal.
    ///
    /// `after` is a message id; the page contains messages with strictly
    /// greater ordinal. Iterating until `has_next_page` is false yields every
    /// message exactly once.
    pub async fn get_messages(&self, params: GetMessagesParams) -> ServiceResult<MessagePage> {
        let session = self.store.get_session(params.session_id).await?;
        self.store.touch_last_accessed(params.session_id).await?;

        let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let after_ordinal = match params.after {
            Some(cursor) => self.store.ordinal_of(params.session_id, cursor).await?,
            None => 0,
        };

        // Fetch one extra row to learn whether a further page exists.
        let mut messages = self
            .store
            .messages_after(params.session_id, after_ordinal, limit + 1)
            .await?;
        let has_next_page = messages.len() as i64 > limit;
        messages.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        let next_cursor = messages.last().map(|m| m.id);
        Ok(MessagePage {
            messages,
            session,
            pagination: Pagination {
                has_next_page,
                next_cursor,
            },
        })
    }

    /// Raw envelopes in ordinal order (export/debug).
    pub async fn get_raw_messages(&self, session_id: Uuid) -> ServiceResult<Vec<Value>> {
        self.store.get_session(session_id).await?;
        self.store.raw_messages(session_id).await
    }
}
