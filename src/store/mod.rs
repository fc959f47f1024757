//! Persistent storage (SQLite).
//!
//! Three tables (`sessions`, `session_messages`, `job_queue`) behind a narrow
//! transactional API. Write-ahead logging is enabled by default; migrations
//! are bundled and applied in order at startup, recorded in a `migrations`
//! table keyed by sortable string ids.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

use crate::core::{
    Job, JobData, JobStatus, MessageType, Provider, ServiceError, ServiceResult, Session,
    SessionMessage, SessionState,
};

/// One bundled migration, identified by a sortable string id.
struct Migration {
    id: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001_sessions",
        sql: r"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                project_path TEXT NOT NULL,
                name TEXT NOT NULL,
                claude_directory_path TEXT,
                provider_session_id TEXT,
                state TEXT NOT NULL DEFAULT 'active',
                context TEXT,
                metadata TEXT,
                is_working INTEGER NOT NULL DEFAULT 0,
                current_job_id TEXT,
                last_job_status TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                token_count INTEGER NOT NULL DEFAULT 0,
                next_ordinal INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL,
                last_message_sent_at TEXT
            );
        ",
    },
    Migration {
        id: "0002_session_messages",
        sql: r"
            CREATE TABLE IF NOT EXISTS session_messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                ordinal INTEGER NOT NULL,
                type TEXT NOT NULL,
                parent_tool_use_id TEXT,
                content_data TEXT NOT NULL,
                provider_session_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_session_messages_session_ordinal
                ON session_messages(session_id, ordinal);
        ",
    },
    Migration {
        id: "0003_job_queue",
        sql: r"
            CREATE TABLE IF NOT EXISTS job_queue (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                prompt_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 1,
                lease_until TEXT,
                data TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_job_queue_lease
                ON job_queue(status, session_id, created_at);
        ",
    },
    // One-active-job-per-session is a database constraint, not an
    // application check: concurrent writers race past a check-then-insert.
    Migration {
        id: "0004_one_active_job",
        sql: r"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_job_queue_one_active
                ON job_queue(session_id)
                WHERE status IN ('pending', 'processing');
        ",
    },
];

/// Tuning options applied when the pool is opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Enable write-ahead logging.
    pub wal: bool,
    /// SQLite page cache size, in pages.
    pub cache_size: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            wal: true,
            cache_size: 1_000_000,
        }
    }
}

/// Fields a client may patch on a session. `None` leaves a field untouched.
#[derive(Debug, Default, Clone)]
pub struct SessionPatch {
    /// Replace the free-form context.
    pub context: Option<String>,
    /// Replace the free-form metadata.
    pub metadata: Option<Value>,
}

/// Input for one message append.
#[derive(Debug)]
pub struct NewMessage {
    /// Owning session.
    pub session_id: Uuid,
    /// Normalized type.
    pub message_type: MessageType,
    /// Link from a tool_result back to its tool_use.
    pub parent_tool_use_id: Option<String>,
    /// Raw envelope, persisted verbatim.
    pub content_data: Value,
    /// The agent's session handle carried on this envelope.
    pub provider_session_id: Option<String>,
    /// Tokens to add to the session counter.
    pub token_delta: i64,
    /// Whether this append stamps `last_message_sent_at`.
    pub is_user_prompt: bool,
}

/// Drift found and repaired by the consistency check.
#[derive(Debug)]
pub struct RepairedSession {
    /// The session whose derived state drifted.
    pub session_id: Uuid,
    /// `is_working` before repair.
    pub was_working: bool,
    /// `is_working` after repair.
    pub now_working: bool,
    /// `message_count` before repair.
    pub recorded_messages: i64,
    /// Actual row count after repair.
    pub actual_messages: i64,
}

/// SQLite-backed store for sessions, messages, and the job queue.
pub struct Store {
    pool: SqlitePool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database at `db_path` and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or a migration
    /// fails.
    pub async fn open(db_path: &Path, options: &StoreOptions) -> ServiceResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::Internal(e.into()))?;
        }

        let mut connect = SqliteConnectOptions::from_str(&format!(
            "sqlite:{display}",
            display = db_path.display()
        ))
        .map_err(ServiceError::Database)?
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_secs(5))
        .pragma("cache_size", options.cache_size.to_string())
        .foreign_keys(true);

        if options.wal {
            connect = connect.pragma("journal_mode", "WAL");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory store (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub async fn open_in_memory() -> ServiceResult<Self> {
        let connect = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(ServiceError::Database)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Apply all bundled migrations that have not been applied yet.
    async fn run_migrations(pool: &SqlitePool) -> ServiceResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS migrations (
                id TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        for migration in MIGRATIONS {
            let applied: Option<String> =
                sqlx::query_scalar("SELECT id FROM migrations WHERE id = ?")
                    .bind(migration.id)
                    .fetch_optional(pool)
                    .await?;
            if applied.is_some() {
                continue;
            }

            tracing::info!(migration = migration.id, "applying migration");
            sqlx::raw_sql(migration.sql).execute(pool).await?;
            sqlx::query("INSERT INTO migrations (id, applied_at) VALUES (?, ?)")
                .bind(migration.id)
                .bind(Utc::now().to_rfc3339())
                .execute(pool)
                .await?;
        }

        Ok(())
    }

    // ===== sessions =====

    /// Insert a new session row.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub async fn insert_session(&self, session: &Session) -> ServiceResult<()> {
        sqlx::query(
            r"
            INSERT INTO sessions (
                id, provider, project_path, name, claude_directory_path,
                provider_session_id, state, context, metadata,
                is_working, current_job_id, last_job_status,
                message_count, token_count, next_ordinal,
                created_at, updated_at, last_accessed_at, last_message_sent_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
            ",
        )
        .bind(session.id.to_string())
        .bind(session.provider.as_str())
        .bind(session.project_path.to_string_lossy().to_string())
        .bind(&session.name)
        .bind(
            session
                .claude_directory_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(&session.provider_session_id)
        .bind(session.state.as_str())
        .bind(&session.context)
        .bind(
            session
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(session.is_working)
        .bind(session.current_job_id.map(|id| id.to_string()))
        .bind(&session.last_job_status)
        .bind(session.message_count)
        .bind(session.token_count)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.last_accessed_at.to_rfc3339())
        .bind(session.last_message_sent_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch a session; `NotFound` if absent.
    pub async fn get_session(&self, id: Uuid) -> ServiceResult<Session> {
        self.find_session(id).await?.ok_or(ServiceError::NotFound {
            entity: "session",
            id: id.to_string(),
        })
    }

    /// Fetch a session if it exists.
    pub async fn find_session(&self, id: Uuid) -> ServiceResult<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// List sessions ordered by `last_message_sent_at DESC NULLS LAST,
    /// updated_at DESC`, with the unfiltered total for pagination.
    pub async fn list_sessions(
        &self,
        state: Option<SessionState>,
        limit: i64,
        offset: i64,
    ) -> ServiceResult<(Vec<Session>, i64)> {
        let (rows, total) = if let Some(state) = state {
            let rows = sqlx::query_as::<_, SessionRow>(
                r"
                SELECT * FROM sessions WHERE state = ?
                ORDER BY last_message_sent_at IS NULL, last_message_sent_at DESC, updated_at DESC
                LIMIT ? OFFSET ?
                ",
            )
            .bind(state.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE state = ?")
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await?;
            (rows, total)
        } else {
            let rows = sqlx::query_as::<_, SessionRow>(
                r"
                SELECT * FROM sessions
                ORDER BY last_message_sent_at IS NULL, last_message_sent_at DESC, updated_at DESC
                LIMIT ? OFFSET ?
                ",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
                .fetch_one(&self.pool)
                .await?;
            (rows, total)
        };

        let sessions = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<ServiceResult<Vec<_>>>()?;
        Ok((sessions, total))
    }

    /// Apply a client patch (`context`, `metadata`) and touch `updated_at`.
    pub async fn update_session(&self, id: Uuid, patch: &SessionPatch) -> ServiceResult<Session> {
        let now = Utc::now().to_rfc3339();
        let metadata = patch
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            r"
            UPDATE sessions SET
                context = COALESCE(?, context),
                metadata = COALESCE(?, metadata),
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&patch.context)
        .bind(metadata)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound {
                entity: "session",
                id: id.to_string(),
            });
        }
        self.get_session(id).await
    }

    /// Delete a session and cascade to its messages and jobs.
    ///
    /// Rejects with `Conflict` while the session has an active job.
    pub async fn delete_session(&self, id: Uuid) -> ServiceResult<()> {
        let mut tx = self.pool.begin().await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_queue WHERE session_id = ? AND status IN ('pending', 'processing')",
        )
        .bind(id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            return Err(ServiceError::conflict(
                "cannot delete a session with an active job",
            ));
        }

        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound {
                entity: "session",
                id: id.to_string(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    /// Stamp `last_accessed_at` on a client-serving read. Access also brings
    /// an aged-out session back to `active`.
    pub async fn touch_last_accessed(&self, id: Uuid) -> ServiceResult<()> {
        sqlx::query("UPDATE sessions SET last_accessed_at = ?, state = 'active' WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft-transition sessions untouched for longer than `older_than` to
    /// `inactive`. Returns the number of sessions aged out.
    pub async fn age_out_sessions(&self, older_than: Duration) -> ServiceResult<u64> {
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let result = sqlx::query(
            "UPDATE sessions SET state = 'inactive' WHERE state = 'active' AND last_accessed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Mark the session as driving `job_id` (worker only).
    pub async fn mark_working(&self, id: Uuid, job_id: Uuid) -> ServiceResult<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r"
            UPDATE sessions SET
                is_working = 1, current_job_id = ?, updated_at = ?, last_accessed_at = ?
            WHERE id = ?
            ",
        )
        .bind(job_id.to_string())
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound {
                entity: "session",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Clear the working flags and record the last job outcome (worker only).
    pub async fn mark_idle(&self, id: Uuid, last_status: &str) -> ServiceResult<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r"
            UPDATE sessions SET
                is_working = 0, current_job_id = NULL, last_job_status = ?,
                updated_at = ?, last_accessed_at = ?
            WHERE id = ?
            ",
        )
        .bind(last_status)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound {
                entity: "session",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Back-fill the provider's session handle, write-once.
    ///
    /// Returns the previously stored id when it differs from `psid` (the
    /// caller logs the mismatch); `None` when the value was set or already
    /// equal.
    pub async fn backfill_provider_session_id(
        &self,
        id: Uuid,
        psid: &str,
    ) -> ServiceResult<Option<String>> {
        let result = sqlx::query(
            "UPDATE sessions SET provider_session_id = ? WHERE id = ? AND provider_session_id IS NULL",
        )
        .bind(psid)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(None);
        }

        let existing: Option<String> =
            sqlx::query_scalar("SELECT provider_session_id FROM sessions WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?
                .flatten();
        match existing {
            Some(current) if current != psid => Ok(Some(current)),
            _ => Ok(None),
        }
    }

    // ===== messages =====

    /// Append one message.
    ///
    /// Allocates the next per-session ordinal and updates the session's
    /// counters in the same transaction, so `message_count` can never
    /// diverge from the row count.
    #[instrument(skip(self, new), fields(session_id = %new.session_id, message_type = new.message_type.as_str()))]
    pub async fn append_message(&self, new: NewMessage) -> ServiceResult<SessionMessage> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let now_text = now.to_rfc3339();

        let ordinal: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE sessions SET
                next_ordinal = next_ordinal + 1,
                message_count = message_count + 1,
                token_count = token_count + ?,
                updated_at = ?,
                last_message_sent_at = CASE WHEN ? THEN ? ELSE last_message_sent_at END
            WHERE id = ?
            RETURNING next_ordinal
            ",
        )
        .bind(new.token_delta)
        .bind(&now_text)
        .bind(new.is_user_prompt)
        .bind(&now_text)
        .bind(new.session_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(ordinal) = ordinal else {
            return Err(ServiceError::NotFound {
                entity: "session",
                id: new.session_id.to_string(),
            });
        };

        let message = SessionMessage {
            id: Uuid::new_v4(),
            session_id: new.session_id,
            ordinal,
            message_type: new.message_type,
            parent_tool_use_id: new.parent_tool_use_id,
            content_data: new.content_data,
            provider_session_id: new.provider_session_id,
            created_at: now,
        };

        sqlx::query(
            r"
            INSERT INTO session_messages (
                id, session_id, ordinal, type, parent_tool_use_id,
                content_data, provider_session_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(message.ordinal)
        .bind(message.message_type.as_str())
        .bind(&message.parent_tool_use_id)
        .bind(serde_json::to_string(&message.content_data)?)
        .bind(&message.provider_session_id)
        .bind(message.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    /// Resolve a message id to its ordinal within a session.
    pub async fn ordinal_of(&self, session_id: Uuid, message_id: Uuid) -> ServiceResult<i64> {
        sqlx::query_scalar("SELECT ordinal FROM session_messages WHERE id = ? AND session_id = ?")
            .bind(message_id.to_string())
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ServiceError::NotFound {
                entity: "message",
                id: message_id.to_string(),
            })
    }

    /// Messages with ordinal strictly greater than `after_ordinal`, ascending.
    pub async fn messages_after(
        &self,
        session_id: Uuid,
        after_ordinal: i64,
        limit: i64,
    ) -> ServiceResult<Vec<SessionMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r"
            SELECT * FROM session_messages
            WHERE session_id = ? AND ordinal > ?
            ORDER BY ordinal ASC
            LIMIT ?
            ",
        )
        .bind(session_id.to_string())
        .bind(after_ordinal)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Raw envelopes in ordinal order (export/debug).
    pub async fn raw_messages(&self, session_id: Uuid) -> ServiceResult<Vec<Value>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT content_data FROM session_messages WHERE session_id = ? ORDER BY ordinal ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|text| serde_json::from_str(text).map_err(ServiceError::from))
            .collect()
    }

    /// Count message rows for a session.
    pub async fn count_messages(&self, session_id: Uuid) -> ServiceResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM session_messages WHERE session_id = ?")
                .bind(session_id.to_string())
                .fetch_one(&self.pool)
                .await?,
        )
    }

    // ===== job queue =====

    /// Insert a pending job.
    ///
    /// One-active-job-per-session is enforced by the partial unique index on
    /// `job_queue(session_id)`; a violation surfaces as `Conflict` no matter
    /// how many writers race.
    #[instrument(skip(self, job), fields(session_id = %job.session_id, job_id = %job.id))]
    pub async fn insert_job(&self, job: &Job) -> ServiceResult<()> {
        let result = sqlx::query(
            r"
            INSERT INTO job_queue (
                id, session_id, prompt_id, provider, status, attempts, max_attempts,
                lease_until, data, error, created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(job.id.to_string())
        .bind(job.session_id.to_string())
        .bind(&job.prompt_id)
        .bind(job.provider.as_str())
        .bind(job.status.as_str())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.lease_until.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&job.data)?)
        .bind(&job.error)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(ServiceError::conflict("a prompt is already in progress"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a job; `NotFound` if absent.
    pub async fn get_job(&self, id: Uuid) -> ServiceResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM job_queue WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into)
            .transpose()?
            .ok_or(ServiceError::NotFound {
                entity: "job",
                id: id.to_string(),
            })
    }

    /// Lease the next runnable job, if any.
    ///
    /// Selects the oldest pending job whose backoff gate has passed, or a
    /// processing job whose lease expired (crashed worker), marks it
    /// processing, increments `attempts`, and stamps a fresh lease.
    pub async fn lease_next_job(&self, lease_ttl: Duration) -> ServiceResult<Option<Job>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let now_text = now.to_rfc3339();

        let candidate: Option<String> = sqlx::query_scalar(
            r"
            SELECT id FROM job_queue
            WHERE (status = 'pending' AND (lease_until IS NULL OR lease_until <= ?))
               OR (status = 'processing' AND lease_until < ?)
            ORDER BY created_at ASC
            LIMIT 1
            ",
        )
        .bind(&now_text)
        .bind(&now_text)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        sqlx::query(
            r"
            UPDATE job_queue SET
                status = 'processing',
                attempts = attempts + 1,
                lease_until = ?,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind((now + lease_ttl).to_rfc3339())
        .bind(&now_text)
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM job_queue WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(row.try_into()?))
    }

    /// Extend a processing job's lease. Idempotent.
    pub async fn extend_lease(&self, id: Uuid, lease_ttl: Duration) -> ServiceResult<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE job_queue SET lease_until = ?, updated_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind((now + lease_ttl).to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transition a job to `completed`. Rejects terminal jobs.
    pub async fn complete_job(&self, id: Uuid) -> ServiceResult<Job> {
        let mut tx = self.pool.begin().await?;
        let job: Job = sqlx::query_as::<_, JobRow>("SELECT * FROM job_queue WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ServiceError::NotFound {
                entity: "job",
                id: id.to_string(),
            })?
            .try_into()?;

        if job.status.is_terminal() {
            return Err(ServiceError::conflict(format!(
                "job {id} is already {status}",
                status = job.status.as_str()
            )));
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r"
            UPDATE job_queue SET
                status = 'completed', lease_until = NULL, completed_at = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_job(id).await
    }

    /// Record a failure.
    ///
    /// While attempts remain, the job returns to `pending` with a backoff
    /// gate of `min(lease_ttl * 2^(attempts - 1), max_backoff)`; otherwise it
    /// transitions to `failed`.
    pub async fn fail_job(
        &self,
        id: Uuid,
        error: &str,
        lease_ttl: Duration,
        max_backoff: Duration,
    ) -> ServiceResult<Job> {
        let mut tx = self.pool.begin().await?;
        let job: Job = sqlx::query_as::<_, JobRow>("SELECT * FROM job_queue WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ServiceError::NotFound {
                entity: "job",
                id: id.to_string(),
            })?
            .try_into()?;

        if job.status.is_terminal() {
            return Err(ServiceError::conflict(format!(
                "job {id} is already {status}",
                status = job.status.as_str()
            )));
        }

        let now = Utc::now();
        let now_text = now.to_rfc3339();
        if job.attempts < job.max_attempts {
            let exponent = u32::try_from(job.attempts.saturating_sub(1)).unwrap_or(0).min(20);
            let backoff = std::cmp::min(lease_ttl * 2_i32.pow(exponent), max_backoff);
            sqlx::query(
                r"
                UPDATE job_queue SET
                    status = 'pending', lease_until = ?, error = ?, updated_at = ?
                WHERE id = ?
                ",
            )
            .bind((now + backoff).to_rfc3339())
            .bind(error)
            .bind(&now_text)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r"
                UPDATE job_queue SET
                    status = 'failed', lease_until = NULL, error = ?, completed_at = ?, updated_at = ?
                WHERE id = ?
                ",
            )
            .bind(error)
            .bind(&now_text)
            .bind(&now_text)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_job(id).await
    }

    /// Cancel every active job for a session.
    ///
    /// Pending and processing jobs transition directly to `cancelled`; the
    /// worker's cancellation checker observes the session losing its active
    /// job and aborts the runner.
    pub async fn cancel_session_jobs(&self, session_id: Uuid) -> ServiceResult<Vec<Job>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM job_queue WHERE session_id = ? AND status IN ('pending', 'processing')",
        )
        .bind(session_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        for id in &ids {
            sqlx::query(
                r"
                UPDATE job_queue SET
                    status = 'cancelled', lease_until = NULL, completed_at = ?, updated_at = ?
                WHERE id = ?
                ",
            )
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let id = Uuid::parse_str(&id).map_err(|e| ServiceError::Internal(e.into()))?;
            jobs.push(self.get_job(id).await?);
        }
        Ok(jobs)
    }

    /// Whether the session has a pending or processing job.
    pub async fn has_active_jobs(&self, session_id: Uuid) -> ServiceResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_queue WHERE session_id = ? AND status IN ('pending', 'processing')",
        )
        .bind(session_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// The session's active job, if any.
    pub async fn active_job(&self, session_id: Uuid) -> ServiceResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r"
            SELECT * FROM job_queue
            WHERE session_id = ? AND status IN ('pending', 'processing')
            ORDER BY created_at ASC
            LIMIT 1
            ",
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Delete terminal jobs older than the retention window. Returns the
    /// number of rows pruned.
    pub async fn prune_terminal_jobs(&self, older_than: Duration) -> ServiceResult<u64> {
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let result = sqlx::query(
            r"
            DELETE FROM job_queue
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND COALESCE(completed_at, updated_at) < ?
            ",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ===== consistency =====

    /// Repair derived session state that drifted from the job and message
    /// tables. Returns what changed so the caller can log it.
    pub async fn repair_session_state(&self) -> ServiceResult<Vec<RepairedSession>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r"
            SELECT
                s.id AS id,
                s.is_working AS is_working,
                s.current_job_id AS current_job_id,
                s.message_count AS message_count,
                (SELECT COUNT(*) FROM session_messages m WHERE m.session_id = s.id) AS actual_messages,
                (SELECT j.id FROM job_queue j
                 WHERE j.session_id = s.id AND j.status IN ('pending', 'processing')
                 ORDER BY j.created_at ASC LIMIT 1) AS active_job_id
            FROM sessions s
            ",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut repaired = Vec::new();
        for row in rows {
            let id: String = row.try_get("id")?;
            let was_working: bool = row.try_get("is_working")?;
            let current_job_id: Option<String> = row.try_get("current_job_id")?;
            let recorded_messages: i64 = row.try_get("message_count")?;
            let actual_messages: i64 = row.try_get("actual_messages")?;
            let active_job_id: Option<String> = row.try_get("active_job_id")?;

            let now_working = active_job_id.is_some();
            let consistent = was_working == now_working
                && current_job_id == active_job_id
                && recorded_messages == actual_messages;
            if consistent {
                continue;
            }

            sqlx::query(
                r"
                UPDATE sessions SET
                    is_working = ?, current_job_id = ?, message_count = ?, updated_at = ?
                WHERE id = ?
                ",
            )
            .bind(now_working)
            .bind(&active_job_id)
            .bind(actual_messages)
            .bind(Utc::now().to_rfc3339())
            .bind(&id)
            .execute(&mut *tx)
            .await?;

            repaired.push(RepairedSession {
                session_id: Uuid::parse_str(&id).map_err(|e| ServiceError::Internal(e.into()))?,
                was_working,
                now_working,
                recorded_messages,
                actual_messages,
            });
        }

        tx.commit().await?;
        Ok(repaired)
    }
}

// ===== row types =====

/// Row type for the sessions table.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    provider: String,
    project_path: String,
    name: String,
    claude_directory_path: Option<String>,
    provider_session_id: Option<String>,
    state: String,
    context: Option<String>,
    metadata: Option<String>,
    is_working: bool,
    current_job_id: Option<String>,
    last_job_status: Option<String>,
    message_count: i64,
    token_count: i64,
    #[allow(dead_code)]
    next_ordinal: i64,
    created_at: String,
    updated_at: String,
    last_accessed_at: String,
    last_message_sent_at: Option<String>,
}

fn parse_timestamp(field: &'static str, text: &str) -> ServiceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(Into::into)
        .map_err(|e| ServiceError::Internal(anyhow::anyhow!("invalid {field} '{text}': {e}")))
}

impl TryFrom<SessionRow> for Session {
    type Error = ServiceError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| ServiceError::Internal(anyhow::anyhow!("invalid session id: {e}")))?,
            provider: row
                .provider
                .parse::<Provider>()
                .map_err(ServiceError::Internal)?,
            project_path: PathBuf::from(row.project_path),
            name: row.name,
            claude_directory_path: row.claude_directory_path.map(PathBuf::from),
            provider_session_id: row.provider_session_id,
            state: row
                .state
                .parse::<SessionState>()
                .map_err(ServiceError::Internal)?,
            context: row.context,
            metadata: row
                .metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            is_working: row.is_working,
            current_job_id: row
                .current_job_id
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .map_err(|e| ServiceError::Internal(anyhow::anyhow!("invalid job id: {e}")))?,
            last_job_status: row.last_job_status,
            message_count: row.message_count,
            token_count: row.token_count,
            created_at: parse_timestamp("created_at", &row.created_at)?,
            updated_at: parse_timestamp("updated_at", &row.updated_at)?,
            last_accessed_at: parse_timestamp("last_accessed_at", &row.last_accessed_at)?,
            last_message_sent_at: row
                .last_message_sent_at
                .as_deref()
                .map(|t| parse_timestamp("last_message_sent_at", t))
                .transpose()?,
        })
    }
}

/// Row type for the session_messages table.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    ordinal: i64,
    #[sqlx(rename = "type")]
    message_type: String,
    parent_tool_use_id: Option<String>,
    content_data: String,
    provider_session_id: Option<String>,
    created_at: String,
}

impl TryFrom<MessageRow> for SessionMessage {
    type Error = ServiceError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| ServiceError::Internal(anyhow::anyhow!("invalid message id: {e}")))?,
            session_id: Uuid::parse_str(&row.session_id)
                .map_err(|e| ServiceError::Internal(anyhow::anyhow!("invalid session id: {e}")))?,
            ordinal: row.ordinal,
            message_type: row
                .message_type
                .parse::<MessageType>()
                .map_err(ServiceError::Internal)?,
            parent_tool_use_id: row.parent_tool_use_id,
            content_data: serde_json::from_str(&row.content_data)?,
            provider_session_id: row.provider_session_id,
            created_at: parse_timestamp("created_at", &row.created_at)?,
        })
    }
}

/// Row type for the job_queue table.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    session_id: String,
    prompt_id: String,
    provider: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    lease_until: Option<String>,
    data: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = ServiceError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| ServiceError::Internal(anyhow::anyhow!("invalid job id: {e}")))?,
            session_id: Uuid::parse_str(&row.session_id)
                .map_err(|e| ServiceError::Internal(anyhow::anyhow!("invalid session id: {e}")))?,
            prompt_id: row.prompt_id,
            provider: row
                .provider
                .parse::<Provider>()
                .map_err(ServiceError::Internal)?,
            status: row
                .status
                .parse::<JobStatus>()
                .map_err(ServiceError::Internal)?,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            lease_until: row
                .lease_until
                .as_deref()
                .map(|t| parse_timestamp("lease_until", t))
                .transpose()?,
            data: serde_json::from_str::<JobData>(&row.data)?,
            error: row.error,
            created_at: parse_timestamp("created_at", &row.created_at)?,
            updated_at: parse_timestamp("updated_at", &row.updated_at)?,
            completed_at: row
                .completed_at
                .as_deref()
                .map(|t| parse_timestamp("completed_at", t))
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    fn session() -> Session {
        Session::new(PathBuf::from("/tmp/app"), Provider::ClaudeCode)
    }

    fn pending_job(session_id: Uuid, max_attempts: i64) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            session_id,
            prompt_id: Uuid::new_v4().to_string(),
            provider: Provider::ClaudeCode,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            lease_until: None,
            data: JobData {
                project_path: PathBuf::from("/tmp/app"),
                prompt: "hello".to_owned(),
                model: None,
                allowed_tools: None,
            },
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn user_message(session_id: Uuid) -> NewMessage {
        NewMessage {
            session_id,
            message_type: MessageType::User,
            parent_tool_use_id: None,
            content_data: serde_json::json!({"type": "user", "content": "hi"}),
            provider_session_id: None,
            token_delta: 0,
            is_user_prompt: true,
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let s = store().await;
        Store::run_migrations(&s.pool).await.unwrap();
        Store::run_migrations(&s.pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let s = store().await;
        let mut session = session();
        session.metadata = Some(serde_json::json!({"theme": "dark"}));
        s.insert_session(&session).await.unwrap();

        let loaded = s.get_session(session.id).await.unwrap();
        assert_eq!(loaded.name, "app");
        assert_eq!(loaded.provider, Provider::ClaudeCode);
        assert_eq!(loaded.metadata, session.metadata);
        assert!(!loaded.is_working);
    }

    #[tokio::test]
    async fn test_get_missing_session_is_not_found() {
        let s = store().await;
        let err = s.get_session(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_ordinals() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();

        let m1 = s.append_message(user_message(session.id)).await.unwrap();
        let m2 = s.append_message(user_message(session.id)).await.unwrap();
        let m3 = s.append_message(user_message(session.id)).await.unwrap();
        assert!(m1.ordinal < m2.ordinal && m2.ordinal < m3.ordinal);

        let loaded = s.get_session(session.id).await.unwrap();
        assert_eq!(loaded.message_count, 3);
        assert!(loaded.last_message_sent_at.is_some());
    }

    #[tokio::test]
    async fn test_append_accumulates_tokens() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();

        let mut new = user_message(session.id);
        new.message_type = MessageType::Assistant;
        new.token_delta = 42;
        new.is_user_prompt = false;
        s.append_message(new).await.unwrap();

        let loaded = s.get_session(session.id).await.unwrap();
        assert_eq!(loaded.token_count, 42);
        assert!(loaded.last_message_sent_at.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_conflicts_on_active_job() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();

        s.insert_job(&pending_job(session.id, 1)).await.unwrap();
        let err = s.insert_job(&pending_job(session.id, 1)).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        // Still exactly one row.
        assert!(s.has_active_jobs(session.id).await.unwrap());
        let jobs = s.cancel_session_jobs(session.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_allowed_again_after_job_settles() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();

        // A leased (processing) job still blocks a second enqueue.
        s.insert_job(&pending_job(session.id, 1)).await.unwrap();
        s.lease_next_job(Duration::milliseconds(60_000))
            .await
            .unwrap()
            .unwrap();
        let err = s.insert_job(&pending_job(session.id, 1)).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        // Cancelled jobs leave the active set; a new enqueue succeeds.
        s.cancel_session_jobs(session.id).await.unwrap();
        s.insert_job(&pending_job(session.id, 1)).await.unwrap();

        // Completed jobs do too.
        let leased = s
            .lease_next_job(Duration::milliseconds(60_000))
            .await
            .unwrap()
            .unwrap();
        s.complete_job(leased.id).await.unwrap();
        s.insert_job(&pending_job(session.id, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_increments_attempts() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();
        let job = pending_job(session.id, 2);
        s.insert_job(&job).await.unwrap();

        let leased = s
            .lease_next_job(Duration::milliseconds(60_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, job.id);
        assert_eq!(leased.status, JobStatus::Processing);
        assert_eq!(leased.attempts, 1);
        assert!(leased.lease_until.is_some());

        // No second runnable job while the lease holds.
        assert!(
            s.lease_next_job(Duration::milliseconds(60_000))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_expired_lease_is_re_leased() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();
        s.insert_job(&pending_job(session.id, 3)).await.unwrap();

        // Lease with an already-expired TTL to simulate a crashed worker.
        let first = s
            .lease_next_job(Duration::milliseconds(-1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.attempts, 1);

        let second = s
            .lease_next_job(Duration::milliseconds(60_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 2);
        assert_eq!(second.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_complete_rejects_terminal() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();
        s.insert_job(&pending_job(session.id, 1)).await.unwrap();

        let leased = s
            .lease_next_job(Duration::milliseconds(60_000))
            .await
            .unwrap()
            .unwrap();
        let completed = s.complete_job(leased.id).await.unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(completed.completed_at.is_some());

        let err = s.complete_job(leased.id).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_fail_retries_until_attempt_cap() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();
        s.insert_job(&pending_job(session.id, 2)).await.unwrap();

        let ttl = Duration::milliseconds(60_000);
        let backoff_cap = Duration::minutes(15);

        let leased = s.lease_next_job(ttl).await.unwrap().unwrap();
        let retried = s
            .fail_job(leased.id, "boom", ttl, backoff_cap)
            .await
            .unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.error.as_deref(), Some("boom"));
        // Parked behind its backoff gate.
        assert!(retried.lease_until.unwrap() > Utc::now());

        // Force the gate open and exhaust the final attempt.
        sqlx::query("UPDATE job_queue SET lease_until = NULL WHERE id = ?")
            .bind(retried.id.to_string())
            .execute(&s.pool)
            .await
            .unwrap();
        let leased = s.lease_next_job(ttl).await.unwrap().unwrap();
        assert_eq!(leased.attempts, 2);
        let failed = s
            .fail_job(leased.id, "boom again", ttl, backoff_cap)
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_single_attempt_fails_directly() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();
        s.insert_job(&pending_job(session.id, 1)).await.unwrap();

        let ttl = Duration::milliseconds(60_000);
        let leased = s.lease_next_job(ttl).await.unwrap().unwrap();
        let failed = s
            .fail_job(leased.id, "boom", ttl, Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_transitions_active_jobs() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();
        s.insert_job(&pending_job(session.id, 1)).await.unwrap();

        let jobs = s.cancel_session_jobs(session.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Cancelled);
        assert!(!s.has_active_jobs(session.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_session_blocked_by_active_job() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();
        s.insert_job(&pending_job(session.id, 1)).await.unwrap();

        let err = s.delete_session(session.id).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        s.cancel_session_jobs(session.id).await.unwrap();
        s.delete_session(session.id).await.unwrap();
        assert!(s.find_session(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backfill_provider_session_id_is_write_once() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();

        assert!(
            s.backfill_provider_session_id(session.id, "first")
                .await
                .unwrap()
                .is_none()
        );
        // Same value again: no mismatch.
        assert!(
            s.backfill_provider_session_id(session.id, "first")
                .await
                .unwrap()
                .is_none()
        );
        // Different value: mismatch reported, original kept.
        let mismatch = s
            .backfill_provider_session_id(session.id, "second")
            .await
            .unwrap();
        assert_eq!(mismatch.as_deref(), Some("first"));
        let loaded = s.get_session(session.id).await.unwrap();
        assert_eq!(loaded.provider_session_id.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_repair_fixes_drifted_state() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();
        s.append_message(user_message(session.id)).await.unwrap();

        // Corrupt the derived state directly.
        sqlx::query("UPDATE sessions SET is_working = 1, message_count = 99 WHERE id = ?")
            .bind(session.id.to_string())
            .execute(&s.pool)
            .await
            .unwrap();

        let repaired = s.repair_session_state().await.unwrap();
        assert_eq!(repaired.len(), 1);
        assert!(repaired[0].was_working);
        assert!(!repaired[0].now_working);
        assert_eq!(repaired[0].actual_messages, 1);

        let loaded = s.get_session(session.id).await.unwrap();
        assert!(!loaded.is_working);
        assert_eq!(loaded.message_count, 1);
    }

    #[tokio::test]
    async fn test_prune_removes_old_terminal_jobs() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();
        s.insert_job(&pending_job(session.id, 1)).await.unwrap();
        let jobs = s.cancel_session_jobs(session.id).await.unwrap();

        // Age the row past the retention window.
        sqlx::query("UPDATE job_queue SET completed_at = ? WHERE id = ?")
            .bind((Utc::now() - Duration::days(40)).to_rfc3339())
            .bind(jobs[0].id.to_string())
            .execute(&s.pool)
            .await
            .unwrap();

        let pruned = s.prune_terminal_jobs(Duration::days(30)).await.unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn test_list_sessions_orders_by_recency() {
        let s = store().await;
        let quiet = Session::new(PathBuf::from("/tmp/quiet"), Provider::ClaudeCode);
        let busy = Session::new(PathBuf::from("/tmp/busy"), Provider::CodexCli);
        s.insert_session(&quiet).await.unwrap();
        s.insert_session(&busy).await.unwrap();
        s.append_message(user_message(busy.id)).await.unwrap();

        let (sessions, total) = s.list_sessions(None, 20, 0).await.unwrap();
        assert_eq!(total, 2);
        // The session with a message sorts before the one without.
        assert_eq!(sessions[0].id, busy.id);
        assert_eq!(sessions[1].id, quiet.id);
    }

    #[tokio::test]
    async fn test_messages_after_window() {
        let s = store().await;
        let session = session();
        s.insert_session(&session).await.unwrap();
        for _ in 0..5 {
            s.append_message(user_message(session.id)).await.unwrap();
        }

        let page = s.messages_after(session.id, 2, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].ordinal, 3);
        assert_eq!(page[1].ordinal, 4);
    }
}
