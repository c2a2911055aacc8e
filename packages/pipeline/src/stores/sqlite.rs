//! SQLite job store.
//!
//! The durable backend for job/batch state. The claim operation is a
//! single conditional `UPDATE ... RETURNING`, which SQLite executes
//! atomically; that statement is the only concurrency-control point in
//! the whole pipeline.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::traits::store::{JobFilter, JobStore};
use crate::types::{
    batch::{Batch, BatchStatus},
    job::{Job, JobStatus},
};

fn storage_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Storage(e.to_string().into())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC timestamps so string comparison in SQL matches
    // chronological order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| storage_err(format!("invalid timestamp {raw:?}: {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| storage_err(format!("invalid uuid {raw:?}: {e}")))
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Create a store with the given connection URL.
    ///
    /// # Example URLs
    /// - `sqlite::memory:` - In-memory database (ephemeral)
    /// - `sqlite://jobs.db?mode=rwc` - File-based, create if missing
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    ///
    /// Uses a single connection: every pooled connection to
    /// `sqlite::memory:` would otherwise get its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                total_batches INTEGER NOT NULL,
                input_ref TEXT NOT NULL,
                final_artifact_ref TEXT,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                batch_index INTEGER NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                input_ref TEXT NOT NULL,
                output_ref TEXT,
                last_error TEXT,
                claimed_by TEXT,
                next_attempt_at TEXT,
                UNIQUE(job_id, batch_index)
            );

            CREATE INDEX IF NOT EXISTS idx_batches_job_id ON batches(job_id);
            CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    owner: String,
    status: String,
    created_at: String,
    total_batches: i64,
    input_ref: String,
    final_artifact_ref: Option<String>,
    error: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| storage_err(format!("unknown job status {:?}", self.status)))?;
        Ok(Job {
            id: parse_uuid(&self.id)?,
            owner: self.owner,
            status,
            created_at: parse_ts(&self.created_at)?,
            total_batches: self.total_batches as u32,
            input_ref: self.input_ref,
            final_artifact_ref: self.final_artifact_ref,
            error: self.error,
        })
    }
}

#[derive(Debug, FromRow)]
struct BatchRow {
    id: String,
    job_id: String,
    batch_index: i64,
    status: String,
    attempt_count: i64,
    max_retries: i64,
    input_ref: String,
    output_ref: Option<String>,
    last_error: Option<String>,
    claimed_by: Option<String>,
    next_attempt_at: Option<String>,
}

impl BatchRow {
    fn into_batch(self) -> Result<Batch> {
        let status = BatchStatus::parse(&self.status)
            .ok_or_else(|| storage_err(format!("unknown batch status {:?}", self.status)))?;
        Ok(Batch {
            id: parse_uuid(&self.id)?,
            job_id: parse_uuid(&self.job_id)?,
            index: self.batch_index as u32,
            status,
            attempt_count: self.attempt_count as u32,
            max_retries: self.max_retries as u32,
            input_ref: self.input_ref,
            output_ref: self.output_ref,
            last_error: self.last_error,
            claimed_by: self.claimed_by.as_deref().map(parse_uuid).transpose()?,
            next_attempt_at: self.next_attempt_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_job(&self, job: &Job, batches: &[Batch]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, owner, status, created_at, total_batches, input_ref)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.owner)
        .bind(job.status.as_str())
        .bind(fmt_ts(job.created_at))
        .bind(job.total_batches as i64)
        .bind(&job.input_ref)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        for batch in batches {
            sqlx::query(
                r#"
                INSERT INTO batches
                    (id, job_id, batch_index, status, attempt_count, max_retries, input_ref)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(batch.id.to_string())
            .bind(batch.job_id.to_string())
            .bind(batch.index as i64)
            .bind(batch.status.as_str())
            .bind(batch.attempt_count as i64)
            .bind(batch.max_retries as i64)
            .bind(&batch.input_ref)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(JobRow::into_job).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        // LIMIT -1 means unbounded in SQLite
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE (?1 = '' OR owner = ?1)
              AND (?2 = '' OR status = ?2)
            ORDER BY created_at DESC
            LIMIT ?3
            "#,
        )
        .bind(filter.owner.clone().unwrap_or_default())
        .bind(filter.status.map(|s| s.as_str()).unwrap_or_default())
        .bind(filter.limit.map(|l| l as i64).unwrap_or(-1))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .ok_or(PipelineError::JobNotFound { job_id })?;

        let mut job = row.into_job()?;
        job.transition_to(status)?;

        sqlx::query("UPDATE jobs SET status = ?1 WHERE id = ?2")
            .bind(job.status.as_str())
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)
    }

    async fn complete_job(&self, job_id: Uuid, artifact_ref: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .ok_or(PipelineError::JobNotFound { job_id })?;
        let mut job = row.into_job()?;
        job.transition_to(JobStatus::Completed)?;

        // Status and artifact land together or not at all
        sqlx::query("UPDATE jobs SET status = ?1, final_artifact_ref = ?2 WHERE id = ?3")
            .bind(job.status.as_str())
            .bind(artifact_ref)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .ok_or(PipelineError::JobNotFound { job_id })?;
        let mut job = row.into_job()?;
        job.transition_to(JobStatus::Failed)?;

        sqlx::query("UPDATE jobs SET status = ?1, error = ?2 WHERE id = ?3")
            .bind(job.status.as_str())
            .bind(error)
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)
    }

    async fn reopen_job(&self, job_id: Uuid) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE jobs SET status = 'running', error = NULL WHERE id = ?1 AND status = 'failed'",
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if updated.rows_affected() == 0 {
            let job = self
                .get_job(job_id)
                .await?
                .ok_or(PipelineError::JobNotFound { job_id })?;
            return Err(PipelineError::InvalidTransition {
                from: job.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }
        Ok(())
    }

    async fn claim_next_batch(&self, job_id: Uuid, worker_id: Uuid) -> Result<Option<Batch>> {
        // One conditional UPDATE: SQLite serializes writers, so two
        // concurrent callers cannot both move the same row out of
        // 'pending'.
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            UPDATE batches
            SET status = 'claimed',
                attempt_count = attempt_count + 1,
                claimed_by = ?1,
                next_attempt_at = NULL
            WHERE id = (
                SELECT id FROM batches
                WHERE job_id = ?2
                  AND status = 'pending'
                  AND attempt_count < max_retries + 1
                  AND (next_attempt_at IS NULL OR next_attempt_at <= ?3)
                ORDER BY batch_index ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id.to_string())
        .bind(job_id.to_string())
        .bind(fmt_ts(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(BatchRow::into_batch).transpose()
    }

    async fn complete_batch(&self, batch_id: Uuid, output_ref: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE batches
            SET status = 'completed', output_ref = ?1, claimed_by = NULL, last_error = NULL
            WHERE id = ?2 AND status = 'claimed'
            "#,
        )
        .bind(output_ref)
        .bind(batch_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if updated.rows_affected() == 0 {
            let batch = self
                .get_batch(batch_id)
                .await?
                .ok_or(PipelineError::BatchNotFound { batch_id })?;
            return Err(PipelineError::InvalidTransition {
                from: batch.status.to_string(),
                to: BatchStatus::Completed.to_string(),
            });
        }
        Ok(())
    }

    async fn fail_batch(
        &self,
        batch_id: Uuid,
        error: &str,
        permanent: bool,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<BatchStatus> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let row = sqlx::query_as::<_, BatchRow>("SELECT * FROM batches WHERE id = ?1")
            .bind(batch_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .ok_or(PipelineError::BatchNotFound { batch_id })?;
        let batch = row.into_batch()?;

        if batch.status != BatchStatus::Claimed {
            return Err(PipelineError::InvalidTransition {
                from: batch.status.to_string(),
                to: BatchStatus::Failed.to_string(),
            });
        }

        let terminal = permanent || batch.attempts_exhausted();
        let (status, gate) = if terminal {
            (BatchStatus::Failed, None)
        } else {
            (BatchStatus::Pending, next_attempt_at)
        };

        sqlx::query(
            r#"
            UPDATE batches
            SET status = ?1, last_error = ?2, claimed_by = NULL, next_attempt_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(gate.map(fmt_ts))
        .bind(batch_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(status)
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        let row = sqlx::query_as::<_, BatchRow>("SELECT * FROM batches WHERE id = ?1")
            .bind(batch_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(BatchRow::into_batch).transpose()
    }

    async fn batches_for_job(&self, job_id: Uuid) -> Result<Vec<Batch>> {
        let rows = sqlx::query_as::<_, BatchRow>(
            "SELECT * FROM batches WHERE job_id = ?1 ORDER BY batch_index ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(BatchRow::into_batch).collect()
    }

    async fn outstanding_batches(&self, job_id: Uuid) -> Result<Vec<Batch>> {
        let rows = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT * FROM batches
            WHERE job_id = ?1 AND status IN ('pending', 'claimed')
            ORDER BY batch_index ASC
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(BatchRow::into_batch).collect()
    }

    async fn completed_batch_ids(&self, job_id: Uuid) -> Result<Vec<Uuid>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM batches
            WHERE job_id = ?1 AND status = 'completed'
            ORDER BY batch_index ASC
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        ids.into_iter().map(|(id,)| parse_uuid(&id)).collect()
    }

    async fn release_claims(&self, job_id: Uuid) -> Result<usize> {
        let updated = sqlx::query(
            r#"
            UPDATE batches
            SET status = 'pending', claimed_by = NULL
            WHERE job_id = ?1 AND status = 'claimed'
            "#,
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(updated.rows_affected() as usize)
    }

    async fn clear_backoff_gates(&self, job_id: Uuid) -> Result<usize> {
        let updated = sqlx::query(
            r#"
            UPDATE batches
            SET next_attempt_at = NULL
            WHERE job_id = ?1 AND status = 'pending' AND next_attempt_at IS NOT NULL
            "#,
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(updated.rows_affected() as usize)
    }

    async fn reset_failed_batches(&self, job_id: Uuid) -> Result<usize> {
        let updated = sqlx::query(
            r#"
            UPDATE batches
            SET status = 'pending', attempt_count = 0, claimed_by = NULL, next_attempt_at = NULL
            WHERE job_id = ?1 AND status = 'failed'
            "#,
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(updated.rows_affected() as usize)
    }

    async fn purge_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let cutoff = fmt_ts(cutoff);

        sqlx::query(
            r#"
            DELETE FROM batches WHERE job_id IN (
                SELECT id FROM jobs
                WHERE status IN ('completed', 'failed', 'cancelled') AND created_at < ?1
            )
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled') AND created_at < ?1
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(deleted.rows_affected() as usize)
    }
}
