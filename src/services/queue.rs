use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::bus::{EventBus, SessionEvent};
use crate::core::{Job, JobData, JobStatus, Provider, ServiceResult};
use crate::store::Store;

/// Ceiling on the exponential retry backoff, in milliseconds.
const MAX_BACKOFF_MS: i64 = 15 * 60 * 1000;

/// Input for [`QueueService::enqueue`].
#[derive(Debug)]
pub struct EnqueueJob {
    /// Owning session.
    pub session_id: Uuid,
    /// Provider copied from the session.
    pub provider: Provider,
    /// Per-job correlation id used in events.
    pub prompt_id: String,
    /// Prompt payload.
    pub data: JobData,
}

/// Durable job queue on top of the store, plus the event bus fan-out used by
/// the worker.
pub struct QueueService {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    lease_ttl: Duration,
    max_attempts: i64,
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("lease_ttl", &self.lease_ttl)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl QueueService {
    /// Create the service. `lease_ttl_ms` bounds how long a worker may hold
    /// a processing job before it becomes re-leasable.
    #[must_use]
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, lease_ttl_ms: u64, max_attempts: i64) -> Self {
        Self {
            store,
            bus,
            lease_ttl: Duration::milliseconds(i64::try_from(lease_ttl_ms).unwrap_or(60_000)),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Insert a pending job for the session.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the session already has a pending or
    /// processing job.
    #[instrument(skip(self, input), fields(session_id = %input.session_id, prompt_id = %input.prompt_id))]
    pub async fn enqueue(&self, input: EnqueueJob) -> ServiceResult<Job> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            session_id: input.session_id,
            prompt_id: input.prompt_id,
            provider: input.provider,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            lease_until: None,
            data: input.data,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.store.insert_job(&job).await?;
        tracing::info!(job_id = %job.id, session_id = %job.session_id, "job enqueued");
        Ok(job)
    }

    /// Lease the next runnable job, if any. Increments `attempts`.
    pub async fn get_next_job(&self) -> ServiceResult<Option<Job>> {
        self.store.lease_next_job(self.lease_ttl).await
    }

    /// Extend a processing job's lease. Idempotent.
    pub async fn mark_job_processing(&self, id: Uuid) -> ServiceResult<()> {
        self.store.extend_lease(id, self.lease_ttl).await
    }

    /// Transition a job to `completed`.
    pub async fn mark_job_completed(&self, id: Uuid) -> ServiceResult<Job> {
        let job = self.store.complete_job(id).await?;
        tracing::info!(job_id = %id, "job completed");
        Ok(job)
    }

    /// Record a failure: retry with backoff while attempts remain, otherwise
    /// transition to `failed`.
    pub async fn mark_job_failed(&self, id: Uuid, error: &str) -> ServiceResult<Job> {
        let job = self
            .store
            .fail_job(id, error, self.lease_ttl, Duration::milliseconds(MAX_BACKOFF_MS))
            .await?;
        match job.status {
            JobStatus::Pending => tracing::warn!(
                job_id = %id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                "job failed, queued for retry"
            ),
            _ => tracing::warn!(job_id = %id, attempts = job.attempts, "job failed permanently"),
        }
        Ok(job)
    }

    /// Cancel every active job for the session. Pending and processing jobs
    /// transition to `cancelled`; the worker notices within its cancellation
    /// check interval and aborts the runner.
    pub async fn cancel_session_jobs(&self, session_id: Uuid) -> ServiceResult<Vec<Job>> {
        let jobs = self.store.cancel_session_jobs(session_id).await?;
        if !jobs.is_empty() {
            tracing::info!(session_id = %session_id, count = jobs.len(), "cancelled session jobs");
        }
        Ok(jobs)
    }

    /// Whether the session has an active (pending or processing) job.
    pub async fn has_active_jobs(&self, session_id: Uuid) -> ServiceResult<bool> {
        self.store.has_active_jobs(session_id).await
    }

    /// Publish an event under the session's topic.
    pub fn publish_event(&self, session_id: Uuid, event: &SessionEvent) {
        self.bus.publish(session_id, event);
    }

    /// Delete terminal jobs older than `days`.
    pub async fn prune_terminal_older_than(&self, days: i64) -> ServiceResult<u64> {
        let pruned = self.store.prune_terminal_jobs(Duration::days(days)).await?;
        if pruned > 0 {
            tracing::info!(pruned, "pruned terminal jobs");
        }
        Ok(pruned)
    }

    /// Prune on an hourly cadence until shutdown.
    pub fn spawn_retention_loop(
        self: &Arc<Self>,
        retention_days: i64,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = service.prune_terminal_older_than(retention_days).await {
                    tracing::error!(error = %e, "job retention pass failed");
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(std::time::Duration::from_secs(3600)) => {}
                }
            }
        })
    }
}
