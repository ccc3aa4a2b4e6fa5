use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cropscan_core::{apply_event, Job, JobEvent, JobStatus, NewJob, PUBLISH_CONFIRM_GRACE_SECS};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::error::{JobStoreError, JobStoreResult};
use crate::store::{Applied, CancelOutcome, JobStore};

const JOB_COLUMNS: &str = r#"
    job_id,
    stored_file_id,
    analysis_type,
    parameters,
    status,
    created_at,
    updated_at,
    result,
    error,
    cancel_requested,
    attempts,
    publish_failed,
    publish_attempts,
    next_publish_at,
    finished_at
"#;

const ACTIVE_STATUSES: &str = "('queued', 'processing', 'failed')";
const TERMINAL_STATUSES: &str = "('completed', 'cancelled_cooperative', 'failed_permanently')";

/// Lost CAS rounds tolerated before reporting a conflict.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Conditional write of a computed transition. `None` when another writer
    /// changed the row since `expected` was read.
    async fn compare_and_swap(&self, expected: &Job, next: &Job) -> JobStoreResult<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = $3,
                result = $4,
                error = $5,
                attempts = $6,
                publish_failed = $7,
                next_publish_at = $8,
                finished_at = $9,
                updated_at = $10
            WHERE job_id = $1
                AND status = $2
                AND attempts = $11
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<Postgres, Job>(&sql)
            .bind(expected.job_id)
            .bind(expected.status.as_str())
            .bind(next.status.as_str())
            .bind(&next.result)
            .bind(next.error.as_ref().map(Json))
            .bind(next.attempts)
            .bind(next.publish_failed)
            .bind(next.next_publish_at)
            .bind(next.finished_at)
            .bind(next.updated_at)
            .bind(expected.attempts)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[tracing::instrument(skip(self, new_job), fields(job_id = %new_job.job_id))]
    async fn create(&self, new_job: NewJob) -> JobStoreResult<Job> {
        let sql = format!(
            r#"
            INSERT INTO jobs (
                job_id, stored_file_id, analysis_type, parameters, status,
                publish_failed, next_publish_at
            )
            VALUES ($1, $2, $3, $4, 'queued', TRUE, $5)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job_id = new_job.job_id;
        let publish_deadline = Utc::now() + chrono::Duration::seconds(PUBLISH_CONFIRM_GRACE_SECS);
        sqlx::query_as::<Postgres, Job>(&sql)
            .bind(job_id)
            .bind(&new_job.stored_file_id)
            .bind(new_job.analysis_type.to_string())
            .bind(Json(&new_job.parameters))
            .bind(publish_deadline)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    JobStoreError::AlreadyExists(job_id)
                }
                other => JobStoreError::Database(other),
            })
    }

    async fn get(&self, job_id: Uuid) -> JobStoreResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1");
        Ok(sqlx::query_as::<Postgres, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    #[tracing::instrument(skip(self, event), fields(event = event.name()))]
    async fn apply(&self, job_id: Uuid, event: JobEvent) -> JobStoreResult<Applied> {
        let mut observed = JobStatus::Queued;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(job_id).await?.ok_or(JobStoreError::NotFound(job_id))?;
            observed = current.status;
            let Some(next) = apply_event(&current, &event, Utc::now())? else {
                return Ok(Applied {
                    job: current,
                    changed: false,
                });
            };
            if let Some(job) = self.compare_and_swap(&current, &next).await? {
                return Ok(Applied { job, changed: true });
            }
            tracing::debug!(%job_id, status = %current.status, "Lost job transition race, re-reading");
        }
        Err(JobStoreError::Conflict { job_id, observed })
    }

    async fn request_cancel(&self, job_id: Uuid) -> JobStoreResult<CancelOutcome> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET cancel_requested = TRUE,
                updated_at = NOW()
            WHERE job_id = $1
                AND cancel_requested = FALSE
                AND status IN {ACTIVE_STATUSES}
            RETURNING {JOB_COLUMNS}
            "#
        );
        if let Some(job) = sqlx::query_as::<Postgres, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(CancelOutcome::Requested(job));
        }

        let job = self.get(job_id).await?.ok_or(JobStoreError::NotFound(job_id))?;
        if job.is_terminal() {
            Ok(CancelOutcome::AlreadyTerminal(job))
        } else {
            Ok(CancelOutcome::AlreadyRequested(job))
        }
    }

    async fn mark_publish_failed(
        &self,
        job_id: Uuid,
        next_attempt_at: DateTime<Utc>,
    ) -> JobStoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET publish_failed = TRUE,
                publish_attempts = publish_attempts + 1,
                next_publish_at = $2,
                updated_at = NOW()
            WHERE job_id = $1
                AND status = 'queued'
            "#,
        )
        .bind(job_id)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_publish_failed(&self, job_id: Uuid) -> JobStoreResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET publish_failed = FALSE,
                next_publish_at = NULL,
                updated_at = NOW()
            WHERE job_id = $1
                AND publish_failed
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_for_republish(&self, now: DateTime<Utc>, limit: usize) -> JobStoreResult<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'queued'
                AND publish_failed
                AND COALESCE(next_publish_at, created_at) <= $1
            ORDER BY next_publish_at ASC NULLS FIRST
            LIMIT $2
            "#
        );
        Ok(sqlx::query_as::<Postgres, Job>(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn has_active_references(&self, file_id: &str) -> JobStoreResult<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM jobs WHERE stored_file_id = $1 AND status IN {ACTIVE_STATUSES})"
        );
        let row = sqlx::query(&sql).bind(file_id).fetch_one(&self.pool).await?;
        Ok(row.get::<bool, _>(0))
    }

    async fn delete_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> JobStoreResult<u64> {
        let sql = format!(
            r#"
            WITH doomed AS (
                SELECT job_id
                FROM jobs
                WHERE status IN {TERMINAL_STATUSES}
                    AND finished_at < $1
                ORDER BY finished_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ),
            deleted AS (
                DELETE FROM jobs
                WHERE job_id IN (SELECT job_id FROM doomed)
                RETURNING job_id
            )
            SELECT COUNT(*)::bigint FROM deleted
            "#
        );
        let row = sqlx::query(&sql)
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_one(&self.pool)
            .await?;

        let count: i64 = row.get(0);
        let count = count.max(0) as u64;
        if count > 0 {
            tracing::info!(count, cutoff = %cutoff, "Deleted expired terminal jobs");
        }
        Ok(count)
    }
}
