use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::session::Provider;

/// Lifecycle state of a queued job.
///
/// ```text
/// pending ──lease──▶ processing ──complete──▶ completed
/// pending ──cancel──▶ cancelled     ▲
/// processing ──fail,attempts<max──▶ pending (with backoff)
/// processing ──fail,attempts≥max──▶ failed
/// processing ──cancel──▶ cancelled
/// processing ──lease-expired──▶ pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be leased.
    Pending,

    /// Leased by a worker; the lease expires at `lease_until`.
    Processing,

    /// Finished successfully. Absorbing.
    Completed,

    /// Exhausted its attempts. Absorbing.
    Failed,

    /// Cancelled by the client. Absorbing.
    Cancelled,
}

impl JobStatus {
    /// Tag persisted in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states admit no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active states count toward the one-active-job-per-session rule.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => anyhow::bail!("unknown job status: {s}"),
        }
    }
}

/// Payload the worker needs to drive one prompt through an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    /// Workspace the agent runs in.
    pub project_path: PathBuf,

    /// The prompt text.
    pub prompt: String,

    /// Model flag passed to the agent executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Tools the agent may use without prompting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
}

/// A unit of queued work driving the agent for one prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique identifier.
    pub id: Uuid,

    /// Owning session.
    pub session_id: Uuid,

    /// Per-job external correlation id used in events.
    pub prompt_id: String,

    /// Provider copied from the session at enqueue time.
    pub provider: Provider,

    /// Current lifecycle state.
    pub status: JobStatus,

    /// Lease count; incremented on every lease including re-leases.
    pub attempts: i64,

    /// Retry cap.
    pub max_attempts: i64,

    /// Lease expiry while processing; doubles as the retry-backoff gate on
    /// a pending row.
    pub lease_until: Option<DateTime<Utc>>,

    /// Prompt payload.
    pub data: JobData,

    /// Last recorded failure, if any.
    pub error: Option<String>,

    /// Insertion time.
    pub created_at: DateTime<Utc>,

    /// Last transition time.
    pub updated_at: DateTime<Utc>,

    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}
