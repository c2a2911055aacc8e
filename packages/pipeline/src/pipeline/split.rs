//! Splitter: partition an ordered input into fixed-size batches.

use tracing::info;

use crate::error::{PipelineError, Result};
use crate::traits::store::{input_fragment_ref, FragmentStore, JobStore};
use crate::types::{batch::Batch, config::PipelineConfig, job::Job, row::TargetRow};

/// Partition rows into batches of `batch_size`, preserving order.
///
/// Every batch except the last has exactly `batch_size` rows. Fails with
/// a validation error on empty input or a zero batch size.
pub fn split_rows(rows: &[TargetRow], batch_size: usize) -> Result<Vec<Vec<TargetRow>>> {
    if batch_size == 0 {
        return Err(PipelineError::Validation {
            reason: "batch size must be greater than zero".to_string(),
        });
    }
    if rows.is_empty() {
        return Err(PipelineError::Validation {
            reason: "input contains no rows".to_string(),
        });
    }
    Ok(rows.chunks(batch_size).map(|c| c.to_vec()).collect())
}

/// Split input rows and persist the resulting job.
///
/// Writes one input fragment per batch at its index-addressed ref, then
/// inserts the job and all batch rows in a single store transaction, so
/// a validation failure or storage error never leaves a partial job
/// behind (orphaned fragments without a job row are harmless and are
/// cleaned up with the job tree).
pub async fn create_job<S, F>(
    store: &S,
    fragments: &F,
    owner: &str,
    input_ref: &str,
    rows: Vec<TargetRow>,
    config: &PipelineConfig,
) -> Result<Job>
where
    S: JobStore + ?Sized,
    F: FragmentStore + ?Sized,
{
    let chunks = split_rows(&rows, config.batch_size)?;
    let total_rows = rows.len();

    let job = Job::new(owner, input_ref, chunks.len() as u32);
    let mut batches = Vec::with_capacity(chunks.len());

    for (index, chunk) in chunks.iter().enumerate() {
        let index = index as u32;
        let fragment_ref = input_fragment_ref(job.id, index);
        fragments.write_rows(&fragment_ref, chunk).await?;
        batches.push(Batch::new(
            job.id,
            index,
            fragment_ref,
            config.retry.max_retries,
        ));
    }

    store.insert_job(&job, &batches).await?;

    info!(
        job_id = %job.id,
        owner = %job.owner,
        rows = total_rows,
        batches = batches.len(),
        "Created job"
    );
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{MemoryFragmentStore, MemoryJobStore};
    use crate::types::job::JobStatus;
    use proptest::prelude::*;

    fn rows(n: usize) -> Vec<TargetRow> {
        (0..n).map(|i| TargetRow::new(format!("row-{i}"))).collect()
    }

    #[test]
    fn test_split_exact_and_partial_batches() {
        let chunks = split_rows(&rows(25), 10).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[1].len(), 10);
        assert_eq!(chunks[2].len(), 5);

        // Order preserved across the split boundary
        assert_eq!(chunks[1][0].id, "row-10");
        assert_eq!(chunks[2][4].id, "row-24");
    }

    #[test]
    fn test_split_single_partial_batch() {
        let chunks = split_rows(&rows(3), 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 3);
    }

    #[test]
    fn test_split_rejects_empty_input() {
        let err = split_rows(&[], 10).unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }

    #[test]
    fn test_split_rejects_zero_batch_size() {
        let err = split_rows(&rows(5), 0).unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
    }

    proptest! {
        #[test]
        fn prop_split_conserves_rows(total in 1usize..2000, batch_size in 1usize..200) {
            let input = rows(total);
            let chunks = split_rows(&input, batch_size).unwrap();

            // No row lost or duplicated
            let sum: usize = chunks.iter().map(|c| c.len()).sum();
            prop_assert_eq!(sum, total);

            // All but the last batch are full
            for chunk in &chunks[..chunks.len() - 1] {
                prop_assert_eq!(chunk.len(), batch_size);
            }

            // Concatenation reproduces the input order
            let rejoined: Vec<_> = chunks.iter().flatten().cloned().collect();
            prop_assert_eq!(rejoined, input);
        }
    }

    #[tokio::test]
    async fn test_create_job_persists_fragments_and_rows() {
        let store = MemoryJobStore::new();
        let fragments = MemoryFragmentStore::new();
        let config = PipelineConfig::new().with_batch_size(10);

        let job = create_job(&store, &fragments, "ops@example.com", "upload.csv", rows(25), &config)
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total_batches, 3);
        assert_eq!(fragments.fragment_count(), 3);

        let batches = store.batches_for_job(job.id).await.unwrap();
        assert_eq!(batches.len(), 3);
        // Indices form a contiguous range from 0
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.index, i as u32);
        }

        // Each fragment re-reads to its slice
        let last = fragments.read_rows(&batches[2].input_ref).await.unwrap();
        assert_eq!(last.len(), 5);
        assert_eq!(last[0].id, "row-20");
    }

    #[tokio::test]
    async fn test_create_job_empty_input_creates_nothing() {
        let store = MemoryJobStore::new();
        let fragments = MemoryFragmentStore::new();
        let config = PipelineConfig::new();

        let err = create_job(&store, &fragments, "ops@example.com", "upload.csv", vec![], &config)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
        assert_eq!(fragments.fragment_count(), 0);
        assert!(store
            .list_jobs(&crate::traits::store::JobFilter::all())
            .await
            .unwrap()
            .is_empty());
    }
}
