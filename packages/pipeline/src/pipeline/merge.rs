//! Merger: fold per-batch outputs into one ordered artifact.

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::traits::store::{artifact_ref, output_fragment_ref, FragmentStore, JobStore};
use crate::types::{batch::BatchStatus, row::Record};

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// All batches completed; outputs merged in index order.
    Completed {
        artifact_ref: String,
        record_count: usize,
    },
    /// At least one batch failed terminally; nothing was merged.
    Failed { failed: Vec<FailedBatch> },
}

/// A terminally failed batch, kept so an operator can isolate and re-run
/// just that slice of the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBatch {
    pub index: u32,
    pub error: String,
}

/// Finalize a job if every batch has reached a terminal state.
///
/// Returns `None` while batches are outstanding or once the job is
/// already terminal. When all batches are terminal:
///
/// - any failed batch fails the whole job without merging (fail-fast);
/// - otherwise outputs are concatenated in ascending batch index order.
///   An empty output fragment is a valid outcome and is skipped with a
///   warning; a corrupt one aborts the merge with an integrity error and
///   leaves all job and batch state untouched for inspection.
pub async fn try_finalize<S, F>(store: &S, fragments: &F, job_id: Uuid) -> Result<Option<JobOutcome>>
where
    S: JobStore + ?Sized,
    F: FragmentStore + ?Sized,
{
    let Some(job) = store.get_job(job_id).await? else {
        return Ok(None);
    };
    if job.status.is_terminal() {
        return Ok(None);
    }

    let batches = store.batches_for_job(job_id).await?;
    if batches.iter().any(|b| !b.status.is_terminal()) {
        return Ok(None);
    }

    let failed: Vec<FailedBatch> = batches
        .iter()
        .filter(|b| b.status == BatchStatus::Failed)
        .map(|b| FailedBatch {
            index: b.index,
            error: b
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        })
        .collect();

    if !failed.is_empty() {
        let summary = failed
            .iter()
            .map(|f| format!("batch {}: {}", f.index, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        store.fail_job(job_id, &summary).await?;
        warn!(job_id = %job_id, failed = failed.len(), "Job failed; skipping merge");
        return Ok(Some(JobOutcome::Failed { failed }));
    }

    // All completed: merge in index order. batches_for_job already
    // returns ascending indices.
    let mut merged: Vec<Record> = Vec::new();
    for batch in &batches {
        let Some(output_ref) = batch.output_ref.as_deref() else {
            return Err(PipelineError::Integrity {
                fragment_ref: output_fragment_ref(job_id, batch.index),
                reason: "completed batch has no recorded output".to_string(),
            });
        };
        let records = fragments.read_records(output_ref).await?;
        if records.is_empty() {
            warn!(job_id = %job_id, index = batch.index, "Skipping empty output fragment");
            continue;
        }
        merged.extend(records);
    }

    let artifact = artifact_ref(job_id);
    fragments.write_records(&artifact, &merged).await?;
    store.complete_job(job_id, &artifact).await?;

    info!(
        job_id = %job_id,
        batches = batches.len(),
        records = merged.len(),
        "Job completed; outputs merged"
    );
    Ok(Some(JobOutcome::Completed {
        artifact_ref: artifact,
        record_count: merged.len(),
    }))
}
