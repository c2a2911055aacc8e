//! Worker: claims batches, runs extraction, records outcomes.
//!
//! Workers are stateless between tasks. A queued task only means "this
//! job may have work"; the claim against the store decides whether this
//! worker actually gets a batch, so duplicate or stale tasks are
//! harmless. A worker crash mid-batch leaves the batch `Claimed` and is
//! repaired by the resume controller, never by the worker itself.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::pipeline::merge::try_finalize;
use crate::pipeline::queue::{BatchQueue, BatchTask};
use crate::traits::extractor::Extractor;
use crate::traits::store::{output_fragment_ref, FragmentStore, JobStore};
use crate::types::{
    batch::BatchStatus,
    config::RetryPolicy,
    job::JobStatus,
};

/// One batch-processing loop.
pub struct Worker {
    id: Uuid,
    store: Arc<dyn JobStore>,
    fragments: Arc<dyn FragmentStore>,
    extractor: Arc<dyn Extractor>,
    queue: Arc<BatchQueue>,
    retry: RetryPolicy,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        fragments: Arc<dyn FragmentStore>,
        extractor: Arc<dyn Extractor>,
        queue: Arc<BatchQueue>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            fragments,
            extractor,
            queue,
            retry,
        }
    }

    /// This worker's claim identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Pull tasks until cancelled or the queue closes.
    ///
    /// A failed task is logged and dropped; the batch state in the store
    /// already records the failure, so the loop itself never dies over
    /// one bad batch.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, extractor = self.extractor.name(), "Worker started");
        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = self.queue.dequeue() => task,
            };
            let Some(task) = task else { break };

            if let Err(e) = self.process_task(task).await {
                error!(
                    worker_id = %self.id,
                    job_id = %task.job_id,
                    batch_id = %task.batch_id,
                    error = %e,
                    "Task processing failed"
                );
            }
        }
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Handle one dequeued task.
    pub async fn process_task(&self, task: BatchTask) -> Result<()> {
        let Some(job) = self.store.get_job(task.job_id).await? else {
            debug!(job_id = %task.job_id, "Dropping task for unknown job");
            return Ok(());
        };
        if job.status.is_terminal() {
            debug!(job_id = %job.id, status = %job.status, "Dropping task for terminal job");
            return Ok(());
        }
        if job.status == JobStatus::Pending {
            self.store
                .update_job_status(job.id, JobStatus::Running)
                .await?;
        }

        // The claim, not the queue, decides who works on what.
        let Some(batch) = self.store.claim_next_batch(task.job_id, self.id).await? else {
            debug!(job_id = %task.job_id, "No claimable batch; dropping task");
            return Ok(());
        };

        debug!(
            worker_id = %self.id,
            job_id = %batch.job_id,
            index = batch.index,
            attempt = batch.attempt_count,
            "Claimed batch"
        );

        let rows = match self.fragments.read_rows(&batch.input_ref).await {
            Ok(rows) => rows,
            Err(e) => {
                // A batch whose input slice cannot be read will never
                // succeed on retry.
                warn!(
                    job_id = %batch.job_id,
                    index = batch.index,
                    error = %e,
                    "Input fragment unreadable; failing batch"
                );
                self.store
                    .fail_batch(batch.id, &e.to_string(), true, None)
                    .await?;
                try_finalize(&*self.store, &*self.fragments, batch.job_id).await?;
                return Ok(());
            }
        };

        match self.extractor.extract(&rows).await {
            Ok(records) => {
                let output_ref = output_fragment_ref(batch.job_id, batch.index);
                self.fragments.write_records(&output_ref, &records).await?;
                self.store.complete_batch(batch.id, &output_ref).await?;
                info!(
                    worker_id = %self.id,
                    job_id = %batch.job_id,
                    index = batch.index,
                    records = records.len(),
                    "Batch completed"
                );
            }
            Err(e) if e.is_transient() => {
                let delay = self.retry.delay_for(batch.attempt_count);
                let gate = Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
                let status = self
                    .store
                    .fail_batch(batch.id, e.message(), false, Some(gate))
                    .await?;
                match status {
                    BatchStatus::Pending => {
                        warn!(
                            job_id = %batch.job_id,
                            index = batch.index,
                            attempt = batch.attempt_count,
                            delay_secs = delay.as_secs(),
                            error = e.message(),
                            "Transient failure; batch re-armed"
                        );
                        self.queue.enqueue_after(task, delay);
                        return Ok(());
                    }
                    _ => {
                        warn!(
                            job_id = %batch.job_id,
                            index = batch.index,
                            attempts = batch.attempt_count,
                            error = e.message(),
                            "Retries exhausted; batch failed"
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    job_id = %batch.job_id,
                    index = batch.index,
                    error = e.message(),
                    "Permanent failure; batch failed"
                );
                self.store
                    .fail_batch(batch.id, e.message(), true, None)
                    .await?;
            }
        }

        try_finalize(&*self.store, &*self.fragments, batch.job_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::split::create_job;
    use crate::stores::{MemoryFragmentStore, MemoryJobStore};
    use crate::testing::MockExtractor;
    use crate::types::config::PipelineConfig;
    use crate::types::job::Job;
    use crate::types::row::TargetRow;
    use std::time::Duration;

    fn rows(n: usize) -> Vec<TargetRow> {
        (0..n).map(|i| TargetRow::new(format!("row-{i}"))).collect()
    }

    struct Fixture {
        store: Arc<MemoryJobStore>,
        fragments: Arc<MemoryFragmentStore>,
        mock: MockExtractor,
        queue: Arc<BatchQueue>,
        worker: Worker,
        retry: RetryPolicy,
    }

    fn fixture(mock: MockExtractor, retry: RetryPolicy) -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let fragments = Arc::new(MemoryFragmentStore::new());
        let queue = Arc::new(BatchQueue::new());
        let worker = Worker::new(
            store.clone(),
            fragments.clone(),
            Arc::new(mock.clone()),
            queue.clone(),
            retry.clone(),
        );
        Fixture {
            store,
            fragments,
            mock,
            queue,
            worker,
            retry,
        }
    }

    async fn submit(f: &Fixture, row_count: usize, batch_size: usize) -> Job {
        let config = PipelineConfig::new()
            .with_batch_size(batch_size)
            .with_retry(f.retry.clone());
        let job = create_job(
            &*f.store,
            &*f.fragments,
            "ops@example.com",
            "upload.csv",
            rows(row_count),
            &config,
        )
        .await
        .unwrap();
        for batch in f.store.batches_for_job(job.id).await.unwrap() {
            f.queue
                .enqueue(BatchTask {
                    job_id: job.id,
                    batch_id: batch.id,
                })
                .unwrap();
        }
        job
    }

    #[tokio::test]
    async fn test_single_batch_job_completes() {
        let f = fixture(MockExtractor::new(), RetryPolicy::default());
        let job = submit(&f, 3, 10).await;

        let task = f.queue.try_dequeue().await.unwrap();
        f.worker.process_task(task).await.unwrap();

        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        let artifact = stored.final_artifact_ref.unwrap();
        assert_eq!(f.fragments.read_records(&artifact).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_rearms_and_recovers() {
        let retry = RetryPolicy::default()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(10));
        let mock = MockExtractor::new().with_failures("row-0", 2);
        let f = fixture(mock, retry);
        let job = submit(&f, 2, 10).await;

        // Two failing attempts, each re-arming the batch
        for _ in 0..2 {
            let task = f.queue.dequeue().await.unwrap();
            f.worker.process_task(task).await.unwrap();
            let stored = f.store.get_job(job.id).await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Running);
        }

        // Third attempt (after the backoff timer re-delivers) succeeds
        let task = f.queue.dequeue().await.unwrap();
        f.worker.process_task(task).await.unwrap();

        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);

        let batches = f.store.batches_for_job(job.id).await.unwrap();
        assert_eq!(batches[0].attempt_count, 3);
        assert_eq!(f.mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_job() {
        let retry = RetryPolicy::default()
            .with_max_retries(1)
            .with_base_delay(Duration::from_millis(5));
        let mock = MockExtractor::new().with_failures("row-0", 10);
        let f = fixture(mock, retry);
        let job = submit(&f, 2, 10).await;

        // max_retries = 1 allows two attempts in total
        for _ in 0..2 {
            let task = f.queue.dequeue().await.unwrap();
            f.worker.process_task(task).await.unwrap();
        }

        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.final_artifact_ref.is_none());
        assert_eq!(f.mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_remaining_retries() {
        let mock = MockExtractor::new().with_permanent_failure("row-0");
        let f = fixture(mock, RetryPolicy::default());
        let job = submit(&f, 2, 10).await;

        let task = f.queue.dequeue().await.unwrap();
        f.worker.process_task(task).await.unwrap();

        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(f.mock.call_count(), 1);

        let batches = f.store.batches_for_job(job.id).await.unwrap();
        assert_eq!(batches[0].status, BatchStatus::Failed);
        assert_eq!(batches[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_stale_task_claims_nothing() {
        let f = fixture(MockExtractor::new(), RetryPolicy::default());
        let job = submit(&f, 2, 10).await;

        let task = f.queue.try_dequeue().await.unwrap();
        f.worker.process_task(task).await.unwrap();
        assert_eq!(f.mock.call_count(), 1);

        // A duplicate token for an already-finished job is a no-op
        f.worker.process_task(task).await.unwrap();
        assert_eq!(f.mock.call_count(), 1);

        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_skipped() {
        let f = fixture(MockExtractor::new(), RetryPolicy::default());
        let job = submit(&f, 2, 10).await;
        f.store
            .update_job_status(job.id, JobStatus::Cancelled)
            .await
            .unwrap();

        let task = f.queue.try_dequeue().await.unwrap();
        f.worker.process_task(task).await.unwrap();
        assert_eq!(f.mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_drains_queue_until_cancelled() {
        let f = fixture(MockExtractor::new(), RetryPolicy::default());
        let job = submit(&f, 25, 10).await;

        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            f.store.clone(),
            f.fragments.clone(),
            Arc::new(f.mock.clone()),
            f.queue.clone(),
            RetryPolicy::default(),
        );
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        // Poll until the job reaches a terminal state
        for _ in 0..100 {
            let stored = f.store.get_job(job.id).await.unwrap().unwrap();
            if stored.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();

        let stored = f.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(f.mock.call_count(), 3);
    }
}
