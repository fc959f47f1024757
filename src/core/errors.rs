//! Core error types with rich context for debugging.

use thiserror::Error;

/// Result alias used across service APIs.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors surfaced by the session, message, and queue services.
///
/// The HTTP layer maps these onto status codes and the standard
/// `{error, code, details?}` body; services never swallow unexpected errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed input (bad path, bad id, bad body).
    #[error("{message}")]
    Validation {
        /// Why the input was rejected.
        message: String,
    },

    /// Absent entity.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind, e.g. "session" or "job".
        entity: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// Violated invariant (duplicate active job, deleting a busy session).
    #[error("{message}")]
    Conflict {
        /// Description of the violated invariant.
        message: String,
    },

    /// Child agent process failure; retriable up to the job's attempt cap.
    #[error("agent process failed: {message}")]
    TransientRunner {
        /// Tail of the process stderr or spawn error.
        message: String,
    },

    /// Database failure. Fatal to the request; retriable at a higher layer.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization failure on a persisted column.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected failure; fatal per request.
    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl ServiceError {
    /// Convenience constructor for validation failures.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Convenience constructor for conflicts.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for the HTTP error body.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::TransientRunner { .. }
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}
