//! In-memory storage implementations for testing and development.
//!
//! Not suitable for production: state is lost on restart, which defeats
//! the point of a crash-safe pipeline. The claim operation takes the
//! batches write lock for its whole read-modify-write, which is what
//! makes it atomic here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::stores::{decode_fragment, encode_fragment};
use crate::traits::store::{FragmentStore, JobFilter, JobStore};
use crate::types::{
    batch::{Batch, BatchStatus},
    job::{Job, JobStatus},
    row::{Record, TargetRow},
};

/// In-memory job/batch store.
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    batches: RwLock<HashMap<Uuid, Batch>>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            batches: RwLock::new(HashMap::new()),
        }
    }

    fn with_job<R>(&self, job_id: Uuid, f: impl FnOnce(&mut Job) -> Result<R>) -> Result<R> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(&job_id)
            .ok_or(PipelineError::JobNotFound { job_id })?;
        f(job)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: &Job, batches: &[Batch]) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap();
        let mut stored = self.batches.write().unwrap();
        jobs.insert(job.id, job.clone());
        for batch in batches {
            stored.insert(batch.id, batch.clone());
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().unwrap();
        let mut matched: Vec<Job> = jobs
            .values()
            .filter(|j| filter.owner.as_ref().map_or(true, |o| &j.owner == o))
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        self.with_job(job_id, |job| job.transition_to(status))
    }

    async fn complete_job(&self, job_id: Uuid, artifact_ref: &str) -> Result<()> {
        self.with_job(job_id, |job| {
            job.transition_to(JobStatus::Completed)?;
            job.final_artifact_ref = Some(artifact_ref.to_string());
            Ok(())
        })
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<()> {
        self.with_job(job_id, |job| {
            job.transition_to(JobStatus::Failed)?;
            job.error = Some(error.to_string());
            Ok(())
        })
    }

    async fn reopen_job(&self, job_id: Uuid) -> Result<()> {
        self.with_job(job_id, |job| {
            if job.status != JobStatus::Failed {
                return Err(PipelineError::InvalidTransition {
                    from: job.status.to_string(),
                    to: JobStatus::Running.to_string(),
                });
            }
            job.status = JobStatus::Running;
            job.error = None;
            Ok(())
        })
    }

    async fn claim_next_batch(&self, job_id: Uuid, worker_id: Uuid) -> Result<Option<Batch>> {
        let now = Utc::now();
        // Write lock held across select-and-mutate: this is the atomic
        // conditional transition.
        let mut batches = self.batches.write().unwrap();

        let candidate = batches
            .values()
            .filter(|b| b.job_id == job_id && b.is_claimable(now))
            .min_by_key(|b| b.index)
            .map(|b| b.id);

        let Some(batch_id) = candidate else {
            return Ok(None);
        };

        let batch = batches.get_mut(&batch_id).expect("candidate exists");
        batch.status = BatchStatus::Claimed;
        batch.attempt_count += 1;
        batch.claimed_by = Some(worker_id);
        batch.next_attempt_at = None;
        Ok(Some(batch.clone()))
    }

    async fn complete_batch(&self, batch_id: Uuid, output_ref: &str) -> Result<()> {
        let mut batches = self.batches.write().unwrap();
        let batch = batches
            .get_mut(&batch_id)
            .ok_or(PipelineError::BatchNotFound { batch_id })?;

        if batch.status != BatchStatus::Claimed {
            return Err(PipelineError::InvalidTransition {
                from: batch.status.to_string(),
                to: BatchStatus::Completed.to_string(),
            });
        }

        batch.status = BatchStatus::Completed;
        batch.output_ref = Some(output_ref.to_string());
        batch.claimed_by = None;
        batch.last_error = None;
        Ok(())
    }

    async fn fail_batch(
        &self,
        batch_id: Uuid,
        error: &str,
        permanent: bool,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<BatchStatus> {
        let mut batches = self.batches.write().unwrap();
        let batch = batches
            .get_mut(&batch_id)
            .ok_or(PipelineError::BatchNotFound { batch_id })?;

        if batch.status != BatchStatus::Claimed {
            return Err(PipelineError::InvalidTransition {
                from: batch.status.to_string(),
                to: BatchStatus::Failed.to_string(),
            });
        }

        batch.last_error = Some(error.to_string());
        batch.claimed_by = None;

        if permanent || batch.attempts_exhausted() {
            batch.status = BatchStatus::Failed;
            batch.next_attempt_at = None;
        } else {
            batch.status = BatchStatus::Pending;
            batch.next_attempt_at = next_attempt_at;
        }
        Ok(batch.status)
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        Ok(self.batches.read().unwrap().get(&batch_id).cloned())
    }

    async fn batches_for_job(&self, job_id: Uuid) -> Result<Vec<Batch>> {
        let batches = self.batches.read().unwrap();
        let mut rows: Vec<Batch> = batches
            .values()
            .filter(|b| b.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.index);
        Ok(rows)
    }

    async fn outstanding_batches(&self, job_id: Uuid) -> Result<Vec<Batch>> {
        let batches = self.batches.read().unwrap();
        let mut rows: Vec<Batch> = batches
            .values()
            .filter(|b| b.job_id == job_id && !b.status.is_terminal())
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.index);
        Ok(rows)
    }

    async fn completed_batch_ids(&self, job_id: Uuid) -> Result<Vec<Uuid>> {
        let batches = self.batches.read().unwrap();
        let mut completed: Vec<(u32, Uuid)> = batches
            .values()
            .filter(|b| b.job_id == job_id && b.status == BatchStatus::Completed)
            .map(|b| (b.index, b.id))
            .collect();
        completed.sort_by_key(|(index, _)| *index);
        Ok(completed.into_iter().map(|(_, id)| id).collect())
    }

    async fn release_claims(&self, job_id: Uuid) -> Result<usize> {
        let mut batches = self.batches.write().unwrap();
        let mut released = 0;
        for batch in batches.values_mut() {
            if batch.job_id == job_id && batch.status == BatchStatus::Claimed {
                batch.status = BatchStatus::Pending;
                batch.claimed_by = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn clear_backoff_gates(&self, job_id: Uuid) -> Result<usize> {
        let mut batches = self.batches.write().unwrap();
        let mut cleared = 0;
        for batch in batches.values_mut() {
            if batch.job_id == job_id
                && batch.status == BatchStatus::Pending
                && batch.next_attempt_at.is_some()
            {
                batch.next_attempt_at = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn reset_failed_batches(&self, job_id: Uuid) -> Result<usize> {
        let mut batches = self.batches.write().unwrap();
        let mut reset = 0;
        for batch in batches.values_mut() {
            if batch.job_id == job_id && batch.status == BatchStatus::Failed {
                batch.status = BatchStatus::Pending;
                batch.attempt_count = 0;
                batch.next_attempt_at = None;
                batch.claimed_by = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn purge_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut jobs = self.jobs.write().unwrap();
        let mut batches = self.batches.write().unwrap();

        let doomed: Vec<Uuid> = jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.created_at < cutoff)
            .map(|j| j.id)
            .collect();

        for job_id in &doomed {
            jobs.remove(job_id);
            batches.retain(|_, b| b.job_id != *job_id);
        }
        Ok(doomed.len())
    }
}

/// In-memory fragment store.
pub struct MemoryFragmentStore {
    fragments: RwLock<HashMap<String, String>>,
}

impl Default for MemoryFragmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFragmentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            fragments: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored fragments.
    pub fn fragment_count(&self) -> usize {
        self.fragments.read().unwrap().len()
    }

    /// Corrupt a stored fragment in place (test helper).
    ///
    /// Returns false if the fragment does not exist.
    pub fn poison(&self, fragment_ref: &str) -> bool {
        let mut fragments = self.fragments.write().unwrap();
        match fragments.get_mut(fragment_ref) {
            Some(raw) => {
                raw.truncate(raw.len() / 2);
                true
            }
            None => false,
        }
    }

    fn write(&self, fragment_ref: &str, raw: String) {
        self.fragments
            .write()
            .unwrap()
            .insert(fragment_ref.to_string(), raw);
    }

    fn read(&self, fragment_ref: &str) -> Result<String> {
        self.fragments
            .read()
            .unwrap()
            .get(fragment_ref)
            .cloned()
            .ok_or_else(|| PipelineError::FragmentNotFound {
                fragment_ref: fragment_ref.to_string(),
            })
    }
}

#[async_trait]
impl FragmentStore for MemoryFragmentStore {
    async fn write_rows(&self, fragment_ref: &str, rows: &[TargetRow]) -> Result<()> {
        self.write(fragment_ref, encode_fragment(rows)?);
        Ok(())
    }

    async fn read_rows(&self, fragment_ref: &str) -> Result<Vec<TargetRow>> {
        decode_fragment(fragment_ref, &self.read(fragment_ref)?)
    }

    async fn write_records(&self, fragment_ref: &str, records: &[Record]) -> Result<()> {
        self.write(fragment_ref, encode_fragment(records)?);
        Ok(())
    }

    async fn read_records(&self, fragment_ref: &str) -> Result<Vec<Record>> {
        decode_fragment(fragment_ref, &self.read(fragment_ref)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seed_job(batch_count: u32, max_retries: u32) -> (MemoryJobStore, Job, Vec<Batch>) {
        let store = MemoryJobStore::new();
        let job = Job::new("ops@example.com", "upload.csv", batch_count);
        let batches: Vec<Batch> = (0..batch_count)
            .map(|i| Batch::new(job.id, i, format!("in_{i}"), max_retries))
            .collect();
        store.insert_job(&job, &batches).await.unwrap();
        (store, job, batches)
    }

    #[tokio::test]
    async fn test_claim_orders_by_index_and_increments_attempts() {
        let (store, job, _) = seed_job(3, 2).await;
        let worker = Uuid::new_v4();

        let first = store.claim_next_batch(job.id, worker).await.unwrap().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.attempt_count, 1);
        assert_eq!(first.status, BatchStatus::Claimed);
        assert_eq!(first.claimed_by, Some(worker));

        let second = store.claim_next_batch(job.id, worker).await.unwrap().unwrap();
        assert_eq!(second.index, 1);
    }

    #[tokio::test]
    async fn test_claim_respects_backoff_gate() {
        let (store, job, _) = seed_job(1, 2).await;
        let worker = Uuid::new_v4();

        let batch = store.claim_next_batch(job.id, worker).await.unwrap().unwrap();
        let status = store
            .fail_batch(
                batch.id,
                "timeout",
                false,
                Some(Utc::now() + Duration::hours(1)),
            )
            .await
            .unwrap();
        assert_eq!(status, BatchStatus::Pending);

        // Not yet eligible
        assert!(store.claim_next_batch(job.id, worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_batch_terminal_at_ceiling() {
        let (store, job, _) = seed_job(1, 1).await;
        let worker = Uuid::new_v4();

        // Attempt 1 fails transiently, batch returns to pending
        let b = store.claim_next_batch(job.id, worker).await.unwrap().unwrap();
        assert_eq!(
            store.fail_batch(b.id, "timeout", false, None).await.unwrap(),
            BatchStatus::Pending
        );

        // Attempt 2 hits the ceiling (max_retries = 1 allows 2 attempts)
        let b = store.claim_next_batch(job.id, worker).await.unwrap().unwrap();
        assert_eq!(b.attempt_count, 2);
        assert_eq!(
            store.fail_batch(b.id, "timeout again", false, None).await.unwrap(),
            BatchStatus::Failed
        );

        assert!(store.claim_next_batch(job.id, worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_remaining_retries() {
        let (store, job, _) = seed_job(1, 5).await;
        let worker = Uuid::new_v4();

        let b = store.claim_next_batch(job.id, worker).await.unwrap().unwrap();
        let status = store
            .fail_batch(b.id, "malformed batch", true, None)
            .await
            .unwrap();
        assert_eq!(status, BatchStatus::Failed);

        let stored = store.get_batch(b.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("malformed batch"));
    }

    #[tokio::test]
    async fn test_complete_batch_requires_claim() {
        let (store, _, batches) = seed_job(1, 2).await;
        let err = store
            .complete_batch(batches[0].id, "out_0")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_release_claims_preserves_attempt_count() {
        let (store, job, _) = seed_job(2, 2).await;
        let worker = Uuid::new_v4();

        let b = store.claim_next_batch(job.id, worker).await.unwrap().unwrap();
        assert_eq!(store.release_claims(job.id).await.unwrap(), 1);

        let released = store.get_batch(b.id).await.unwrap().unwrap();
        assert_eq!(released.status, BatchStatus::Pending);
        assert_eq!(released.attempt_count, 1);
        assert_eq!(released.claimed_by, None);
    }

    #[tokio::test]
    async fn test_list_jobs_filtering() {
        let store = MemoryJobStore::new();
        let mut failed = Job::new("a@example.com", "a.csv", 1);
        failed.status = JobStatus::Failed;
        let pending = Job::new("b@example.com", "b.csv", 1);
        store.insert_job(&failed, &[]).await.unwrap();
        store.insert_job(&pending, &[]).await.unwrap();

        let all = store.list_jobs(&JobFilter::all()).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_failed = store
            .list_jobs(&JobFilter::all().with_status(JobStatus::Failed))
            .await
            .unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].owner, "a@example.com");

        let by_owner = store
            .list_jobs(&JobFilter::all().for_owner("b@example.com"))
            .await
            .unwrap();
        assert_eq!(by_owner.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_only_touches_old_terminal_jobs() {
        let store = MemoryJobStore::new();
        let mut done = Job::new("a@example.com", "a.csv", 1);
        done.status = JobStatus::Completed;
        done.created_at = Utc::now() - Duration::days(60);
        let mut running = Job::new("b@example.com", "b.csv", 1);
        running.status = JobStatus::Running;
        running.created_at = Utc::now() - Duration::days(60);
        store.insert_job(&done, &[]).await.unwrap();
        store.insert_job(&running, &[]).await.unwrap();

        let purged = store
            .purge_jobs_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_job(done.id).await.unwrap().is_none());
        assert!(store.get_job(running.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fragment_store_roundtrip_and_poison() {
        let fragments = MemoryFragmentStore::new();
        let rows = vec![TargetRow::new("row-1"), TargetRow::new("row-2")];
        fragments.write_rows("ref-a", &rows).await.unwrap();
        assert_eq!(fragments.read_rows("ref-a").await.unwrap(), rows);

        assert!(fragments.poison("ref-a"));
        let err = fragments.read_rows("ref-a").await.unwrap_err();
        assert!(matches!(err, PipelineError::Integrity { .. }));

        let err = fragments.read_rows("missing").await.unwrap_err();
        assert!(matches!(err, PipelineError::FragmentNotFound { .. }));
    }
}
