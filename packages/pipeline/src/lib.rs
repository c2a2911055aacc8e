//! Resumable batch-job pipeline for large-scale extraction runs.
//!
//! Splits an ordered input of target rows into fixed-size batches,
//! drives each batch through an external extraction service with
//! per-batch retry and backoff, and merges the outputs into a single
//! ordered artifact. All progress lives in a durable [`JobStore`], so a
//! crashed run resumes from its last completed batch instead of
//! starting over.
//!
//! # Architecture
//!
//! ```text
//! input rows -> split -> [batch 0..n] -> queue -> workers -> extraction
//!                            |                       |
//!                        JobStore  <-- claims/outcomes
//!                            |
//!                       try_finalize -> merged artifact
//! ```
//!
//! The queue is volatile and the store is authoritative: a queued task
//! only signals that a job may have work, and the store's atomic claim
//! decides which worker gets which batch.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pipeline::{Pipeline, PipelineConfig, TargetRow};
//! use pipeline::stores::{FsFragmentStore, MemoryJobStore};
//! use pipeline::testing::MockExtractor;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> pipeline::Result<()> {
//! let pipeline = Pipeline::new(
//!     Arc::new(MemoryJobStore::new()),
//!     Arc::new(FsFragmentStore::new("/var/lib/pipeline")),
//!     Arc::new(MockExtractor::new()),
//!     PipelineConfig::new(),
//! );
//!
//! let shutdown = CancellationToken::new();
//! pipeline.spawn_workers(&shutdown);
//!
//! let rows = vec![TargetRow::new("https://example.com/in/jane")];
//! let job = pipeline.submit("ops@example.com", "upload.csv", rows).await?;
//! let outcome = pipeline.run_job(job.id).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod extractors;
pub mod pipeline;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

pub use error::{ExtractError, ExtractResult, PipelineError, Result};
pub use extractors::{ExtractorExt, RateLimitedExtractor};
pub use pipeline::{BatchQueue, BatchTask, FailedBatch, JobOutcome, Pipeline, Worker};
pub use traits::extractor::Extractor;
pub use traits::store::{FragmentStore, JobFilter, JobStore};
pub use types::batch::{Batch, BatchStatus};
pub use types::config::{PipelineConfig, RetryPolicy};
pub use types::job::{Job, JobStatus};
pub use types::row::{Record, TargetRow};
