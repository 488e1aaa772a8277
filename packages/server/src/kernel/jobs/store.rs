//! Durable record of jobs and per-attempt log entries.
//!
//! The [`JobStore`] trait is the only source of job truth for the rest of the
//! kernel; the engine holds no job state across attempts. [`PostgresJobStore`]
//! is the production implementation; an in-memory twin for tests lives in
//! [`super::testing`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::job::{AppUser, Job, JobLog, JobStatus, NewJobLog};

const JOB_COLUMNS: &str = "id, app_name, user_id, account_id, board_id, task_type, status, \
     schedule_type, scheduled_at, cron_expression, polling_interval_seconds, polling_state, \
     payload, created_at, updated_at";

const LOG_COLUMNS: &str =
    "id, job_id, event_type, attempt_number, idempotency_key, error_type, metadata, created_at";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("unique constraint violated")]
    UniqueViolation,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Transactional CRUD over jobs, users and logs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomic find-or-create on the `(app_name, external_user_id)` pair.
    async fn get_or_create_user(
        &self,
        app_name: &str,
        external_user_id: &str,
    ) -> Result<AppUser, StoreError>;

    async fn create_job(&self, job: Job) -> Result<Job, StoreError>;

    async fn load_job(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Set `status`, bumping `updated_at`.
    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError>;

    /// Advance the schedule cursor, bumping `updated_at`.
    async fn update_schedule(
        &self,
        id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Set `status` and `polling_state` together, bumping `updated_at`.
    async fn update_polling(
        &self,
        id: Uuid,
        status: JobStatus,
        polling_state: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Upsert-no-overwrite on the unique idempotency key. Returns the row and
    /// whether this call inserted it. The only write path for logs.
    async fn insert_log_if_absent(&self, log: NewJobLog) -> Result<(JobLog, bool), StoreError>;

    /// Cron jobs that are due: queued, `scheduled_at <= now`, non-empty
    /// expression.
    async fn query_due_cron_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Newest-first log entries for a job.
    async fn list_recent_logs(&self, job_id: Uuid, limit: i64)
        -> Result<Vec<JobLog>, StoreError>;

    /// Liveness probe for health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// PostgreSQL-backed job store.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn get_or_create_user(
        &self,
        app_name: &str,
        external_user_id: &str,
    ) -> Result<AppUser, StoreError> {
        let inserted = sqlx::query_as::<_, AppUser>(
            r#"
            INSERT INTO app_users (app_name, external_user_id)
            VALUES ($1, $2)
            ON CONFLICT (app_name, external_user_id) DO NOTHING
            RETURNING id, app_name, external_user_id, created_at
            "#,
        )
        .bind(app_name)
        .bind(external_user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(user) = inserted {
            return Ok(user);
        }

        // Conflict: the row already existed, re-read it.
        let user = sqlx::query_as::<_, AppUser>(
            r#"
            SELECT id, app_name, external_user_id, created_at
            FROM app_users
            WHERE app_name = $1 AND external_user_id = $2
            "#,
        )
        .bind(app_name)
        .bind(external_user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    async fn create_job(&self, job: Job) -> Result<Job, StoreError> {
        let created = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (
                id, app_name, user_id, account_id, board_id, task_type, status,
                schedule_type, scheduled_at, cron_expression, polling_interval_seconds,
                polling_state, payload, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(&job.app_name)
        .bind(job.user_id)
        .bind(&job.account_id)
        .bind(&job.board_id)
        .bind(&job.task_type)
        .bind(job.status)
        .bind(job.schedule_type)
        .bind(job.scheduled_at)
        .bind(&job.cron_expression)
        .bind(job.polling_interval_seconds)
        .bind(&job.polling_state)
        .bind(&job.payload)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn load_job(&self, id: Uuid) -> Result<Job, StoreError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or(StoreError::NotFound)
    }

    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(status)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_schedule(
        &self,
        id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET scheduled_at = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(scheduled_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_polling(
        &self,
        id: Uuid,
        status: JobStatus,
        polling_state: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1, polling_state = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status)
        .bind(&polling_state)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_log_if_absent(&self, log: NewJobLog) -> Result<(JobLog, bool), StoreError> {
        let inserted = sqlx::query_as::<_, JobLog>(&format!(
            r#"
            INSERT INTO job_logs (job_id, event_type, attempt_number, idempotency_key, error_type, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {LOG_COLUMNS}
            "#
        ))
        .bind(log.job_id)
        .bind(log.event_type)
        .bind(log.attempt_number)
        .bind(&log.idempotency_key)
        .bind(log.error_type)
        .bind(&log.metadata)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row, true));
        }

        // Replayed attempt: converge on the existing row.
        let existing = sqlx::query_as::<_, JobLog>(&format!(
            "SELECT {LOG_COLUMNS} FROM job_logs WHERE idempotency_key = $1"
        ))
        .bind(&log.idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        Ok((existing, false))
    }

    async fn query_due_cron_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE schedule_type = 'cron'
              AND status = 'queued'
              AND scheduled_at IS NOT NULL
              AND scheduled_at <= $1
              AND cron_expression IS NOT NULL
              AND cron_expression <> ''
            ORDER BY scheduled_at ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn list_recent_logs(
        &self,
        job_id: Uuid,
        limit: i64,
    ) -> Result<Vec<JobLog>, StoreError> {
        let logs = sqlx::query_as::<_, JobLog>(&format!(
            r#"
            SELECT {LOG_COLUMNS}
            FROM job_logs
            WHERE job_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
