//! Resume controller: rebuild the volatile queue from durable state.
//!
//! The store is the only source of truth about progress. After a crash
//! the queue is empty and some batches may be stranded in `Claimed` by
//! workers that no longer exist; resuming releases those claims and
//! re-enqueues exactly the batches that still need work. Completed
//! batches are never re-run, so their outputs are reused as-is.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::pipeline::queue::{BatchQueue, BatchTask};
use crate::traits::store::JobStore;

/// Re-enqueue every outstanding batch of a job.
///
/// Returns the number of tasks enqueued: `0` for a job that is already
/// terminal, otherwise the count of non-terminal batches. Backoff gates
/// are cleared first: their redelivery timers died with the process and
/// the wait was served while it was down, so every re-enqueued batch is
/// immediately claimable. Safe to call repeatedly; a duplicate task
/// claims nothing when it is dequeued.
pub async fn resume<S>(store: &S, queue: &Arc<BatchQueue>, job_id: Uuid) -> Result<usize>
where
    S: JobStore + ?Sized,
{
    let Some(job) = store.get_job(job_id).await? else {
        return Err(PipelineError::JobNotFound { job_id });
    };
    if job.status.is_terminal() {
        info!(job_id = %job_id, status = %job.status, "Job already terminal; nothing to resume");
        return Ok(0);
    }

    let released = store.release_claims(job_id).await?;
    if released > 0 {
        warn!(
            job_id = %job_id,
            released,
            "Released claims orphaned by a previous run"
        );
    }

    let cleared = store.clear_backoff_gates(job_id).await?;
    if cleared > 0 {
        info!(job_id = %job_id, cleared, "Cleared stale backoff gates");
    }

    let outstanding = store.outstanding_batches(job_id).await?;
    for batch in &outstanding {
        queue.enqueue(BatchTask {
            job_id,
            batch_id: batch.id,
        })?;
    }

    info!(
        job_id = %job_id,
        total = job.total_batches,
        outstanding = outstanding.len(),
        "Resumed job"
    );
    Ok(outstanding.len())
}

/// Operator override: re-run the failed batches of a `Failed` job.
///
/// Re-arms every terminally failed batch with a fresh attempt budget,
/// moves the job back to `Running`, and enqueues the work. Completed
/// batches keep their outputs. Fails with `InvalidTransition` for jobs
/// in any other state.
pub async fn retry_failed<S>(store: &S, queue: &Arc<BatchQueue>, job_id: Uuid) -> Result<usize>
where
    S: JobStore + ?Sized,
{
    store.reopen_job(job_id).await?;
    let reset = store.reset_failed_batches(job_id).await?;
    info!(job_id = %job_id, reset, "Re-armed failed batches");
    resume(store, queue, job_id).await
}
