//! Storage traits for job state and fragments.
//!
//! The storage layer is split into two focused traits:
//! - `JobStore`: transactional job/batch state, the single source of
//!   truth for what has been done
//! - `FragmentStore`: per-batch input and output payloads
//!
//! All coordination between workers goes through `claim_next_batch`;
//! nothing else in the system is allowed to race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    batch::{Batch, BatchStatus},
    job::{Job, JobStatus},
    row::{Record, TargetRow},
};

/// Filter for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only jobs belonging to this owner
    pub owner: Option<String>,

    /// Only jobs in this status
    pub status: Option<JobStatus>,

    /// Maximum number of jobs returned (newest first)
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to an owner.
    pub fn for_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Restrict to a status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Cap the result count.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Durable record of jobs and batches.
///
/// Implementations must make `claim_next_batch` a single atomic
/// conditional transition: two concurrent callers must never receive the
/// same batch.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job and all of its batches in one transaction.
    ///
    /// Either every row exists afterwards or none do.
    async fn insert_job(&self, job: &Job, batches: &[Batch]) -> Result<()>;

    /// Get a job by id.
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// List jobs matching a filter, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Apply a forward-only status transition.
    ///
    /// Transitioning to the current status is a no-op; anything the
    /// lifecycle disallows fails with `InvalidTransition`.
    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()>;

    /// Transition `Running -> Completed` and record the merged artifact.
    async fn complete_job(&self, job_id: Uuid, artifact_ref: &str) -> Result<()>;

    /// Transition `Running -> Failed` and record the failure summary.
    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Operator override: move a `Failed` job back to `Running`.
    ///
    /// The only sanctioned exception to the forward-only rule; used by
    /// [`retry_failed`](crate::pipeline::resume::retry_failed).
    async fn reopen_job(&self, job_id: Uuid) -> Result<()>;

    /// Atomically claim the next eligible batch of a job.
    ///
    /// Selects the lowest-index batch that is `Pending`, under the retry
    /// ceiling, and past its backoff gate; transitions it to `Claimed`,
    /// increments `attempt_count`, and stamps `claimed_by`. Returns `None`
    /// when no batch is eligible.
    async fn claim_next_batch(&self, job_id: Uuid, worker_id: Uuid) -> Result<Option<Batch>>;

    /// Transition a claimed batch to `Completed` with its output.
    async fn complete_batch(&self, batch_id: Uuid, output_ref: &str) -> Result<()>;

    /// Record a failed attempt on a claimed batch.
    ///
    /// Moves the batch back to `Pending` (gated by `next_attempt_at`)
    /// while attempts remain, or to terminal `Failed` once the ceiling is
    /// hit or the failure is `permanent`. Returns the resulting status.
    async fn fail_batch(
        &self,
        batch_id: Uuid,
        error: &str,
        permanent: bool,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<BatchStatus>;

    /// Get a batch by id.
    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>>;

    /// All batches of a job in ascending index order.
    async fn batches_for_job(&self, job_id: Uuid) -> Result<Vec<Batch>>;

    /// Batches still to be driven: `Pending` or `Claimed`.
    async fn outstanding_batches(&self, job_id: Uuid) -> Result<Vec<Batch>>;

    /// The progress ledger: ids of completed batches.
    ///
    /// Membership is monotonic; a completed batch never leaves this set.
    async fn completed_batch_ids(&self, job_id: Uuid) -> Result<Vec<Uuid>>;

    /// Release orphaned claims (`Claimed -> Pending`) after a crash.
    ///
    /// Does not touch `attempt_count`: the attempt was already charged at
    /// claim time. Returns the number of batches released.
    async fn release_claims(&self, job_id: Uuid) -> Result<usize>;

    /// Clear the backoff gates of a job's pending batches.
    ///
    /// Used on resume: the redelivery timer behind a gate died with the
    /// process, and the wait was served while it was down. Returns the
    /// number of batches cleared.
    async fn clear_backoff_gates(&self, job_id: Uuid) -> Result<usize>;

    /// Operator override: re-arm terminally failed batches.
    ///
    /// Resets `attempt_count` and moves `Failed -> Pending`. Returns the
    /// number of batches reset.
    async fn reset_failed_batches(&self, job_id: Uuid) -> Result<usize>;

    /// Archive terminal jobs created before `cutoff`.
    ///
    /// Returns the number of jobs removed. Non-terminal jobs are never
    /// touched.
    async fn purge_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Storage for batch input/output payloads and merged artifacts.
///
/// Fragments are addressed by the stable refs produced by
/// [`input_fragment_ref`], [`output_fragment_ref`], and [`artifact_ref`],
/// so a worker can re-read its slice on retry without re-deriving it from
/// the full source. Every fragment carries a content hash; reads verify
/// it and fail with `Integrity` on mismatch.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    /// Persist a batch's input slice.
    async fn write_rows(&self, fragment_ref: &str, rows: &[TargetRow]) -> Result<()>;

    /// Read back a batch's input slice.
    async fn read_rows(&self, fragment_ref: &str) -> Result<Vec<TargetRow>>;

    /// Persist extracted records (batch output or merged artifact).
    async fn write_records(&self, fragment_ref: &str, records: &[Record]) -> Result<()>;

    /// Read back extracted records.
    async fn read_records(&self, fragment_ref: &str) -> Result<Vec<Record>>;
}

/// Ref for a batch's input slice.
pub fn input_fragment_ref(job_id: Uuid, index: u32) -> String {
    format!("job_{job_id}/batches/batch_{index:04}.json")
}

/// Ref for a batch's extracted output.
pub fn output_fragment_ref(job_id: Uuid, index: u32) -> String {
    format!("job_{job_id}/outputs/batch_{index:04}_output.json")
}

/// Ref for a job's merged artifact.
pub fn artifact_ref(job_id: Uuid) -> String {
    format!("job_{job_id}/final.json")
}
