use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::core::{Provider, ServiceError, ServiceResult, Session, SessionState};
use crate::store::{SessionPatch, Store};

/// Default page size for session listings.
const DEFAULT_LIST_LIMIT: i64 = 20;
/// Maximum page size for session listings.
const MAX_LIST_LIMIT: i64 = 100;
/// Sessions untouched this long soft-transition to `inactive`.
const INACTIVE_AFTER_DAYS: i64 = 30;

/// Parameters for [`SessionService::list_sessions`].
#[derive(Debug, Default, Clone)]
pub struct ListSessionsParams {
    /// Filter on recency state.
    pub state: Option<SessionState>,
    /// Page size, clamped to `1..=100`; defaults to 20.
    pub limit: Option<i64>,
    /// Page offset.
    pub offset: Option<i64>,
}

/// One page of sessions plus the totals the client needs to paginate.
#[derive(Debug)]
pub struct ListSessionsPage {
    /// Sessions ordered by `last_message_sent_at DESC NULLS LAST,
    /// updated_at DESC`.
    pub sessions: Vec<Session>,
    /// Total matching sessions, ignoring the page window.
    pub total: i64,
    /// The effective limit.
    pub limit: i64,
    /// The effective offset.
    pub offset: i64,
}

/// Session lifecycle and derived working state.
pub struct SessionService {
    store: Arc<Store>,
}

impl std::fmt::Debug for SessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService").finish_non_exhaustive()
    }
}

impl SessionService {
    /// Create the service.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a session for a project directory.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `project_path` is not an absolute
    /// path to an existing directory.
    #[instrument(skip(self), fields(project_path = %project_path.display()))]
    pub async fn create_session(
        &self,
        project_path: PathBuf,
        provider: Provider,
    ) -> ServiceResult<Session> {
        if !project_path.is_absolute() {
            return Err(ServiceError::validation(format!(
                "projectPath must be absolute: {path}",
                path = project_path.display()
            )));
        }
        let metadata = tokio::fs::metadata(&project_path).await.map_err(|_| {
            ServiceError::validation(format!(
                "projectPath does not exist: {path}",
                path = project_path.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(ServiceError::validation(format!(
                "projectPath is not a directory: {path}",
                path = project_path.display()
            )));
        }

        let session = Session::new(project_path, provider);
        self.store.insert_session(&session).await?;
        tracing::info!(session_id = %session.id, name = %session.name, "session created");
        Ok(session)
    }

    /// Fetch a session, stamping `last_accessed_at`.
    pub async fn get_session(&self, id: Uuid) -> ServiceResult<Session> {
        let session = self.store.get_session(id).await?;
        self.store.touch_last_accessed(id).await?;
        Ok(session)
    }

    /// List sessions with clamped pagination.
    pub async fn list_sessions(&self, params: ListSessionsParams) -> ServiceResult<ListSessionsPage> {
        let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let offset = params.offset.unwrap_or(0).max(0);
        let (sessions, total) = self.store.list_sessions(params.state, limit, offset).await?;
        Ok(ListSessionsPage {
            sessions,
            total,
            limit,
            offset,
        })
    }

    /// Patch client-mutable fields (`context`, `metadata`).
    pub async fn update_session(&self, id: Uuid, patch: SessionPatch) -> ServiceResult<Session> {
        self.store.update_session(id, &patch).await
    }

    /// Delete a session and everything under it.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` while the session has an active job.
    pub async fn delete_session(&self, id: Uuid) -> ServiceResult<()> {
        self.store.delete_session(id).await?;
        tracing::info!(session_id = %id, "session deleted");
        Ok(())
    }

    /// Mark the session as driving a job. Worker pool only.
    pub async fn mark_working(&self, id: Uuid, job_id: Uuid) -> ServiceResult<()> {
        self.store.mark_working(id, job_id).await
    }

    /// Clear the working flags after a job finishes. Worker pool only.
    pub async fn mark_idle(&self, id: Uuid, last_status: &str) -> ServiceResult<()> {
        self.store.mark_idle(id, last_status).await
    }

    /// Run one consistency pass: repair `is_working` / `current_job_id` /
    /// `message_count` drift against the job and message tables, and age
    /// out stale sessions.
    pub async fn run_consistency_check(&self) -> ServiceResult<usize> {
        let aged = self
            .store
            .age_out_sessions(chrono::Duration::days(INACTIVE_AFTER_DAYS))
            .await?;
        if aged > 0 {
            tracing::info!(aged, "sessions aged out to inactive");
        }

        let repaired = self.store.repair_session_state().await?;
        for repair in &repaired {
            tracing::warn!(
                session_id = %repair.session_id,
                was_working = repair.was_working,
                now_working = repair.now_working,
                recorded_messages = repair.recorded_messages,
                actual_messages = repair.actual_messages,
                "repaired drifted session state"
            );
        }
        Ok(repaired.len())
    }

    /// Run the consistency check now and then every `interval` until
    /// shutdown.
    pub fn spawn_self_check(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = service.run_consistency_check().await {
                    tracing::error!(error = %e, "session consistency check failed");
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}
