//! Job rows for resolve, merge, resync and harvest work.
//!
//! A harvest's run id is its job id, so this repository doubles as the
//! cancellation signal the harvest pipeline polls.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use taxa_core::defaults::JOB_MAX_RETRIES;
use taxa_core::{
    CancellationSignal, Error, FailureKind, Job, JobRepository, JobStatus, JobType, Result,
};

const JOB_COLUMNS: &str = "id, job_type, status, priority, payload, result, error_message, \
                           retry_count, max_retries, created_at, started_at, completed_at";

/// Requeue while retries remain, unless the failure is permanent or the job
/// was cancelled mid-run. All right-hand sides read the pre-update row.
const FAIL_SQL: &str = "
    UPDATE job SET
        status = CASE
            WHEN status = 'cancelled' THEN status
            WHEN $3 AND retry_count < max_retries THEN 'pending'
            ELSE 'failed'
        END,
        retry_count = CASE
            WHEN status <> 'cancelled' AND $3 AND retry_count < max_retries THEN retry_count + 1
            ELSE retry_count
        END,
        started_at = CASE
            WHEN status <> 'cancelled' AND $3 AND retry_count < max_retries THEN NULL
            ELSE started_at
        END,
        completed_at = CASE
            WHEN status = 'cancelled' THEN completed_at
            WHEN $3 AND retry_count < max_retries THEN NULL
            ELSE now()
        END,
        error_message = $2
    WHERE id = $1
    RETURNING status";

fn job_from_row(row: PgRow) -> Result<Job> {
    Ok(Job {
        id: row.get("id"),
        job_type: row.get::<String, _>("job_type").parse()?,
        status: row.get::<String, _>("status").parse()?,
        priority: row.get("priority"),
        payload: row.get("payload"),
        result: row.get("result"),
        error_message: row.get("error_message"),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

/// PostgreSQL job queue.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
    queued: Arc<Notify>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            queued: Arc::new(Notify::new()),
        }
    }

    /// Fires whenever this process queues or requeues a job.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.queued.clone()
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn queue(
        &self,
        job_type: JobType,
        priority: i32,
        payload: Option<JsonValue>,
    ) -> Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO job (id, job_type, status, priority, payload, max_retries)
             VALUES ($1, $2, 'pending', $3, $4, $5)
             RETURNING id",
        )
        .bind(Uuid::now_v7())
        .bind(job_type.as_str())
        .bind(priority)
        .bind(&payload)
        .bind(JOB_MAX_RETRIES)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(subsystem = "db", component = "jobs", op = "queue", job_id = %id, %job_type, "Job queued");
        self.queued.notify_waiters();
        Ok(id)
    }

    async fn claim(&self, job_types: &[JobType]) -> Result<Option<Job>> {
        if job_types.is_empty() {
            return Ok(None);
        }
        let types: Vec<&str> = job_types.iter().map(JobType::as_str).collect();

        let row = sqlx::query(&format!(
            "UPDATE job SET status = 'running', started_at = now()
             WHERE id = (
                 SELECT id FROM job
                 WHERE status = 'pending' AND job_type = ANY($1)
                 ORDER BY priority DESC, created_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&types)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(job_from_row).transpose()
    }

    async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<()> {
        sqlx::query(
            "UPDATE job
             SET status = CASE WHEN status = 'cancelled' THEN status ELSE 'completed' END,
                 completed_at = now(),
                 result = $2
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(&result)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str, kind: FailureKind) -> Result<JobStatus> {
        let status: Option<String> = sqlx::query_scalar(FAIL_SQL)
            .bind(job_id)
            .bind(error)
            .bind(kind.is_retryable())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        let status: JobStatus = status
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?
            .parse()?;
        if status == JobStatus::Pending {
            self.queued.notify_waiters();
        }
        Ok(status)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let cancelled = sqlx::query(
            "UPDATE job SET status = 'cancelled', completed_at = now()
             WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?
        .rows_affected()
            > 0;
        Ok(cancelled)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .map(job_from_row)
            .transpose()
    }

    async fn pending_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM job WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }
}

#[async_trait]
impl CancellationSignal for PgJobRepository {
    async fn is_cancelled(&self, run_id: Uuid) -> bool {
        let status: std::result::Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM job WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await;

        match status {
            Ok(status) => status.as_deref() == Some(JobStatus::Cancelled.as_str()),
            Err(e) => {
                // A transient read failure must not abort the run.
                warn!(
                    subsystem = "db",
                    component = "jobs",
                    op = "is_cancelled",
                    run_id = %run_id,
                    error = %e,
                    "Cancellation check failed, continuing"
                );
                false
            }
        }
    }
}
