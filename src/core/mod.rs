//! Core domain types: sessions, messages, jobs, and the error taxonomy.

/// Typed error taxonomy shared by all services.
pub mod errors;
/// Durable job queue entries and their state machine.
pub mod job;
/// Canonical append-only session messages.
pub mod message;
/// Session entity and derived working state.
pub mod session;

pub use errors::{ServiceError, ServiceResult};
pub use job::{Job, JobData, JobStatus};
pub use message::{MessageType, SessionMessage};
pub use session::{Provider, Session, SessionState};
