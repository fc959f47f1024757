//! Typed service operations over the store and event bus.
//!
//! Services are the only writers of their respective tables: the session
//! service owns session working-state, the message service owns
//! `session_messages` (and the counters updated with it), and the queue
//! service owns `job_queue`. The worker pool and HTTP layer call these
//! services rather than touching the store directly.

/// Append/read messages and cursor pagination.
pub mod messages;
/// Durable job queue operations.
pub mod queue;
/// Session lifecycle and derived working state.
pub mod sessions;

pub use messages::{GetMessagesParams, MessagePage, MessageService, Pagination, SaveSdkMessage};
pub use queue::{EnqueueJob, QueueService};
pub use sessions::{ListSessionsPage, ListSessionsParams, SessionService};
