//! Pipeline and retry configuration.

use std::time::Duration;

/// Retry/backoff policy applied per batch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Backoff base; the delay before attempt `n + 1` is `base * n`
    pub base_delay: Duration,

    /// Ceiling on the computed delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after a failed attempt.
    ///
    /// `attempt` is the attempt that just failed (1-based), so delays
    /// grow linearly with each failure up to `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(attempt.max(1));
        scaled.min(self.max_delay)
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff base.
    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    /// Set the backoff cap.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }
}

/// Configuration for a pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rows per batch; the last batch of a job may be smaller
    pub batch_size: usize,

    /// Number of concurrent workers. This bounds the number of
    /// outstanding extraction calls and is the primary throttle.
    pub workers: usize,

    /// Per-batch retry policy
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            workers: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a config with the default batch size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
