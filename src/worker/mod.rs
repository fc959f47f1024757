//! Worker pool: drives queued jobs end-to-end.
//!
//! A single polling loop leases jobs; each job runs on its own task inside a
//! bounded pool. The queue's one-active-job-per-session rule guarantees two
//! tasks never process the same session concurrently.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::bus::{DoneStatus, SessionEvent};
use crate::core::{Job, JobStatus, ServiceResult};
use crate::runners::{AgentRunner, RunnerFactory, RunnerRequest};
use crate::services::{MessageService, QueueService, SaveSdkMessage, SessionService};

/// How often a running job re-checks the queue for cancellation.
const CANCELLATION_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Literal appended when a run is cancelled mid-flight.
const CANCELLED_BY_USER: &str = "Operation was cancelled by user";

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum jobs in flight at once (`workerConcurrency`).
    pub concurrency: usize,
    /// Sleep between empty polls (`workerPollingInterval`).
    pub polling_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            polling_interval: Duration::from_millis(1000),
        }
    }
}

/// Drives job execution: lease, run the agent, persist its stream, settle
/// the job and session state.
pub struct WorkerPool {
    sessions: Arc<SessionService>,
    messages: Arc<MessageService>,
    queue: Arc<QueueService>,
    runners: Arc<dyn RunnerFactory>,
    config: WorkerConfig,
    /// Live runners keyed by the job's prompt id.
    active_sessions: Arc<DashMap<String, Arc<dyn AgentRunner>>>,
    in_flight: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("active", &self.active_sessions.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create the pool. Nothing runs until [`WorkerPool::spawn`].
    #[must_use]
    pub fn new(
        sessions: Arc<SessionService>,
        messages: Arc<MessageService>,
        queue: Arc<QueueService>,
        runners: Arc<dyn RunnerFactory>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            sessions,
            messages,
            queue,
            runners,
            config,
            active_sessions: Arc::new(DashMap::new()),
            in_flight: Arc::new(Semaphore::new(concurrency)),
            shutdown,
        }
    }

    /// Start the polling loop on a background task.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.run().await })
    }

    /// Poll the queue until shutdown, fanning jobs out to bounded tasks.
    async fn run(self: Arc<Self>) {
        tracing::info!(concurrency = self.config.concurrency, "worker pool started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Hold a slot before leasing so a lease never waits on capacity.
            let permit = tokio::select! {
                () = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.in_flight).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
            };

            match self.queue.get_next_job().await {
                Ok(Some(job)) => {
                    let pool = Arc::clone(&self);
                    tokio::spawn(async move {
                        pool.process_job(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.polling_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "queue poll failed");
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.polling_interval) => {}
                    }
                }
            }
        }
        tracing::info!("worker pool stopped");
    }

    /// Run one leased job to a settled outcome.
    #[instrument(skip(self, job), fields(job_id = %job.id, session_id = %job.session_id, prompt_id = %job.prompt_id))]
    async fn process_job(&self, job: Job) {
        // A cancel may have landed between the lease and now; if the session
        // no longer has an active job, drop silently.
        match self.queue.has_active_jobs(job.session_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("job cancelled before start, dropping");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "active-job check failed, dropping lease");
                return;
            }
        }

        if let Err(e) = self.begin_job(&job).await {
            tracing::error!(error = %e, "failed to mark job processing");
            return;
        }

        let checker_stop = CancellationToken::new();
        let outcome = self.drive_runner(&job, &checker_stop).await;
        checker_stop.cancel();
        self.active_sessions.remove(&job.prompt_id);

        if self.shutdown.is_cancelled() {
            // Leave the job processing; its lease expires and the next
            // startup re-leases it.
            tracing::info!("shutdown during job, leaving lease to expire");
            return;
        }

        if let Err(e) = self.settle_job(&job, outcome).await {
            tracing::error!(error = %e, "failed to settle job outcome");
        }
    }

    /// Extend the lease and flip the session to working.
    async fn begin_job(&self, job: &Job) -> ServiceResult<()> {
        self.queue.mark_job_processing(job.id).await?;
        self.sessions.mark_working(job.session_id, job.id).await?;
        Ok(())
    }

    /// Instantiate the runner, stream its items into the message service,
    /// and watch for cancellation. Returns the run's outcome.
    async fn drive_runner(&self, job: &Job, checker_stop: &CancellationToken) -> RunOutcome {
        let runner = match self.runners.create(job.provider) {
            Ok(runner) => runner,
            Err(e) => return RunOutcome::failed(e.to_string()),
        };
        self.active_sessions
            .insert(job.prompt_id.clone(), Arc::clone(&runner));
        self.spawn_cancellation_checker(job, Arc::clone(&runner), checker_stop.clone());

        let session = match self.sessions.get_session(job.session_id).await {
            Ok(session) => session,
            Err(e) => return RunOutcome::failed(e.to_string()),
        };

        let request = RunnerRequest {
            session_id: job.session_id,
            project_path: job.data.project_path.clone(),
            prompt: job.data.prompt.clone(),
            model: job.data.model.clone(),
            allowed_tools: job.data.allowed_tools.clone(),
            resume_session_id: session.provider_session_id,
        };
        let mut stream = match runner.execute(request).await {
            Ok(stream) => stream,
            Err(e) => return RunOutcome::failed(e.to_string()),
        };

        let mut run_error: Option<String> = None;
        while let Some(item) = stream.recv().await {
            if item.message.get("type").and_then(serde_json::Value::as_str) == Some("error") {
                run_error = Some(
                    item.message
                        .get("message")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("agent process failed")
                        .to_owned(),
                );
            }
            let saved = self
                .messages
                .save_sdk_message(SaveSdkMessage {
                    session_id: job.session_id,
                    sdk_message: item.message,
                    provider_session_id: item.provider_session_id,
                    provider: item.provider,
                })
                .await;
            if let Err(e) = saved {
                // Persistence failure poisons the run; stop the agent.
                runner.abort();
                return RunOutcome::failed(format!("failed to persist agent message: {e}"));
            }
        }

        match run_error {
            // The stream's error envelope was already persisted above.
            Some(error) => RunOutcome::Failed {
                error,
                recorded: true,
            },
            None => RunOutcome::Finished,
        }
    }

    /// Periodic task aborting the runner once the session loses its active
    /// job (user cancellation, including out-of-band database edits).
    fn spawn_cancellation_checker(
        &self,
        job: &Job,
        runner: Arc<dyn AgentRunner>,
        stop: CancellationToken,
    ) {
        let queue = Arc::clone(&self.queue);
        let session_id = job.session_id;
        let prompt_id = job.prompt_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    () = tokio::time::sleep(CANCELLATION_CHECK_INTERVAL) => {}
                }
                match queue.has_active_jobs(session_id).await {
                    Ok(false) => {
                        tracing::info!(
                            session_id = %session_id,
                            prompt_id = %prompt_id,
                            "cancellation detected, aborting runner"
                        );
                        runner.abort();
                        break;
                    }
                    Ok(true) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "cancellation check failed");
                    }
                }
            }
        });
    }

    /// Record the job's terminal outcome and settle session state.
    async fn settle_job(&self, job: &Job, outcome: RunOutcome) -> ServiceResult<()> {
        // A cancelled job is already terminal; detect it before touching the
        // queue again.
        let cancelled = !self.queue.has_active_jobs(job.session_id).await?;
        if cancelled {
            self.messages
                .save_sdk_message(SaveSdkMessage {
                    session_id: job.session_id,
                    sdk_message: serde_json::json!({
                        "type": "assistant",
                        "content": [{"type": "text", "text": CANCELLED_BY_USER}],
                    }),
                    provider_session_id: None,
                    provider: job.provider,
                })
                .await?;
            self.sessions.mark_idle(job.session_id, "cancelled").await?;
            self.queue.publish_event(job.session_id, &SessionEvent::SessionDone {
                status: DoneStatus::Cancelled,
            });
            return Ok(());
        }

        match outcome {
            RunOutcome::Finished => {
                self.queue.mark_job_completed(job.id).await?;
                self.sessions.mark_idle(job.session_id, "completed").await?;
                self.queue.publish_event(job.session_id, &SessionEvent::SessionDone {
                    status: DoneStatus::Completed,
                });
            }
            RunOutcome::Failed { error, recorded } => {
                if !recorded {
                    self.messages
                        .save_error_message(job.session_id, &error)
                        .await?;
                }
                let failed = self.queue.mark_job_failed(job.id, &error).await?;
                if failed.status == JobStatus::Pending {
                    // Retry scheduled; the session keeps its active job and
                    // stays working until the final attempt settles.
                    tracing::info!(
                        job_id = %job.id,
                        attempts = failed.attempts,
                        "job will be retried"
                    );
                } else {
                    self.sessions.mark_idle(job.session_id, "failed").await?;
                    self.queue.publish_event(job.session_id, &SessionEvent::SessionDone {
                        status: DoneStatus::Failed,
                    });
                }
            }
        }
        Ok(())
    }

    /// Whether a runner is currently registered for a prompt id.
    #[must_use]
    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.active_sessions.contains_key(prompt_id)
    }

    /// Stop polling, abort every live runner, and wait for in-flight job
    /// tasks to finish their cleanup.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.active_sessions.iter() {
            entry.value().abort();
        }
        // Job tasks hold permits; draining the semaphore waits them out.
        let permits = u32::try_from(self.config.concurrency.max(1)).unwrap_or(1);
        let _ = self.in_flight.acquire_many(permits).await;
        tracing::info!("worker pool shut down");
    }
}

/// How a run ended, before queue settlement.
enum RunOutcome {
    /// Stream ended cleanly with no error item.
    Finished,
    /// Runner creation, execution, or persistence failed.
    Failed {
        /// Failure description recorded on the job row.
        error: String,
        /// Whether an error message was already appended to the session
        /// (the runner's own error envelope flows through the stream).
        recorded: bool,
    },
}

impl RunOutcome {
    fn failed(error: String) -> Self {
        Self::Failed {
            error,
            recorded: false,
        }
    }
}
