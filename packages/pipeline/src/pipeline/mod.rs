//! Pipeline orchestration.
//!
//! The stages are plain functions over the storage traits (`split`,
//! `merge`, `resume`) plus the `Worker` loop; `Pipeline` wires them to
//! one store, one fragment store, and one extractor behind a single
//! handle. Cloning the handle shares all of that state, so the same
//! pipeline can be driven from multiple tasks.

pub mod merge;
pub mod queue;
pub mod resume;
pub mod split;
pub mod worker;

pub use merge::{try_finalize, FailedBatch, JobOutcome};
pub use queue::{BatchQueue, BatchTask};
pub use resume::retry_failed;
pub use split::{create_job, split_rows};
pub use worker::Worker;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::traits::extractor::Extractor;
use crate::traits::store::{FragmentStore, JobFilter, JobStore};
use crate::types::{
    batch::{Batch, BatchStatus},
    config::PipelineConfig,
    job::{Job, JobStatus},
    row::TargetRow,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle over one pipeline instance.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn JobStore>,
    fragments: Arc<dyn FragmentStore>,
    extractor: Arc<dyn Extractor>,
    queue: Arc<BatchQueue>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        fragments: Arc<dyn FragmentStore>,
        extractor: Arc<dyn Extractor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            fragments,
            extractor,
            queue: Arc::new(BatchQueue::new()),
            config,
        }
    }

    /// The job/batch store backing this pipeline.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Split input rows into a new job and enqueue all of its batches.
    ///
    /// The job starts `Pending` and moves to `Running` when the first
    /// batch is claimed.
    pub async fn submit(
        &self,
        owner: &str,
        input_ref: &str,
        rows: Vec<TargetRow>,
    ) -> Result<Job> {
        let job = create_job(
            &*self.store,
            &*self.fragments,
            owner,
            input_ref,
            rows,
            &self.config,
        )
        .await?;

        for batch in self.store.batches_for_job(job.id).await? {
            self.queue.enqueue(BatchTask {
                job_id: job.id,
                batch_id: batch.id,
            })?;
        }
        Ok(job)
    }

    /// Rebuild the queue for an interrupted job. See [`resume::resume`].
    pub async fn resume(&self, job_id: Uuid) -> Result<usize> {
        resume::resume(&*self.store, &self.queue, job_id).await
    }

    /// Re-run the failed batches of a `Failed` job. See [`retry_failed`].
    pub async fn retry_failed(&self, job_id: Uuid) -> Result<usize> {
        resume::retry_failed(&*self.store, &self.queue, job_id).await
    }

    /// Cancel a job.
    ///
    /// In-flight batches finish their current attempt; workers drop any
    /// later task for the job.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.store
            .update_job_status(job_id, JobStatus::Cancelled)
            .await?;
        info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.store.get_job(job_id).await
    }

    pub async fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list_jobs(filter).await
    }

    pub async fn batches(&self, job_id: Uuid) -> Result<Vec<Batch>> {
        self.store.batches_for_job(job_id).await
    }

    /// Spawn the configured number of workers.
    ///
    /// Workers run until `shutdown` is triggered; join the handles to
    /// wait for them to drain.
    pub fn spawn_workers(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|_| {
                let worker = Worker::new(
                    self.store.clone(),
                    self.fragments.clone(),
                    self.extractor.clone(),
                    self.queue.clone(),
                    self.config.retry.clone(),
                );
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect()
    }

    /// Wait for a job to reach a terminal state and report its outcome.
    ///
    /// Requires workers to be running (see [`Pipeline::spawn_workers`]);
    /// this call only observes the store. A cancelled job surfaces as
    /// `PipelineError::Cancelled`.
    pub async fn run_job(&self, job_id: Uuid) -> Result<JobOutcome> {
        loop {
            let Some(job) = self.store.get_job(job_id).await? else {
                return Err(PipelineError::JobNotFound { job_id });
            };
            if job.status.is_terminal() {
                return self.outcome_for(&job).await;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn outcome_for(&self, job: &Job) -> Result<JobOutcome> {
        match job.status {
            JobStatus::Completed => {
                let Some(artifact_ref) = job.final_artifact_ref.clone() else {
                    return Err(PipelineError::Integrity {
                        fragment_ref: crate::traits::store::artifact_ref(job.id),
                        reason: "completed job has no recorded artifact".to_string(),
                    });
                };
                let record_count = self.fragments.read_records(&artifact_ref).await?.len();
                Ok(JobOutcome::Completed {
                    artifact_ref,
                    record_count,
                })
            }
            JobStatus::Failed => {
                let failed = self
                    .store
                    .batches_for_job(job.id)
                    .await?
                    .into_iter()
                    .filter(|b| b.status == BatchStatus::Failed)
                    .map(|b| FailedBatch {
                        index: b.index,
                        error: b.last_error.unwrap_or_else(|| "unknown error".to_string()),
                    })
                    .collect();
                Ok(JobOutcome::Failed { failed })
            }
            JobStatus::Cancelled => Err(PipelineError::Cancelled),
            JobStatus::Pending | JobStatus::Running => Err(PipelineError::InvalidTransition {
                from: job.status.to_string(),
                to: "terminal".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{MemoryFragmentStore, MemoryJobStore};
    use crate::testing::MockExtractor;

    fn rows(n: usize) -> Vec<TargetRow> {
        (0..n).map(|i| TargetRow::new(format!("row-{i}"))).collect()
    }

    fn pipeline(mock: MockExtractor, config: PipelineConfig) -> Pipeline {
        Pipeline::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryFragmentStore::new()),
            Arc::new(mock),
            config,
        )
    }

    #[tokio::test]
    async fn test_submit_then_run_to_completion() {
        let config = PipelineConfig::new().with_batch_size(10).with_workers(2);
        let p = pipeline(MockExtractor::new(), config);
        let shutdown = CancellationToken::new();
        let handles = p.spawn_workers(&shutdown);

        let job = p
            .submit("ops@example.com", "upload.csv", rows(25))
            .await
            .unwrap();
        assert_eq!(job.total_batches, 3);

        let outcome = p.run_job(job.id).await.unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Completed {
                record_count: 25,
                ..
            }
        ));

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancelled_job_surfaces_as_cancelled() {
        let p = pipeline(MockExtractor::new(), PipelineConfig::new().with_batch_size(10));
        // No workers running: the job sits Pending until cancelled
        let job = p
            .submit("ops@example.com", "upload.csv", rows(5))
            .await
            .unwrap();
        p.cancel(job.id).await.unwrap();

        let err = p.run_job(job.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let p = pipeline(MockExtractor::new(), PipelineConfig::new().with_batch_size(10));
        let clone = p.clone();

        let job = p
            .submit("ops@example.com", "upload.csv", rows(5))
            .await
            .unwrap();
        assert!(clone.job(job.id).await.unwrap().is_some());
    }
}
