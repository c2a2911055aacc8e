//! Rate-limited extractor wrapper.
//!
//! Wraps any Extractor implementation with rate limiting using the
//! governor crate. The extraction service upstream is rate-limited
//! externally; this wrapper keeps the pipeline from ever presenting a
//! burst the service would reject.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::error::ExtractResult;
use crate::traits::extractor::Extractor;
use crate::types::row::{Record, TargetRow};

type DefaultRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// An extractor wrapper that enforces a ceiling on batch submissions.
///
/// Uses the governor crate for precise rate limiting with burst support.
pub struct RateLimitedExtractor<E: Extractor> {
    inner: E,
    limiter: Arc<DefaultRateLimiter>,
}

impl<E: Extractor> RateLimitedExtractor<E> {
    /// Create a new rate-limited extractor.
    ///
    /// # Arguments
    /// * `extractor` - The underlying extractor to wrap
    /// * `batches_per_second` - Maximum batch submissions per second
    pub fn new(extractor: E, batches_per_second: u32) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(batches_per_second).expect("batches_per_second must be > 0"),
        );
        Self {
            inner: extractor,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Create with burst support.
    pub fn with_burst(extractor: E, batches_per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(batches_per_second).expect("batches_per_second must be > 0"),
        )
        .allow_burst(NonZeroU32::new(burst).expect("burst must be > 0"));

        Self {
            inner: extractor,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Create with a custom quota.
    pub fn with_quota(extractor: E, quota: Quota) -> Self {
        Self {
            inner: extractor,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }
}

#[async_trait]
impl<E: Extractor> Extractor for RateLimitedExtractor<E> {
    async fn extract(&self, rows: &[TargetRow]) -> ExtractResult<Vec<Record>> {
        self.limiter.until_ready().await;
        self.inner.extract(rows).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Extension trait for easy rate limiting.
pub trait ExtractorExt: Extractor + Sized {
    /// Wrap this extractor with rate limiting.
    fn rate_limited(self, batches_per_second: u32) -> RateLimitedExtractor<Self> {
        RateLimitedExtractor::new(self, batches_per_second)
    }

    /// Wrap with rate limiting and burst support.
    fn rate_limited_with_burst(
        self,
        batches_per_second: u32,
        burst: u32,
    ) -> RateLimitedExtractor<Self> {
        RateLimitedExtractor::with_burst(self, batches_per_second, burst)
    }
}

impl<E: Extractor + Sized> ExtractorExt for E {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExtractor;
    use std::time::Instant;

    #[tokio::test]
    async fn test_rate_limiting_spaces_submissions() {
        let mock = MockExtractor::new();
        let extractor = mock.rate_limited(2);

        let rows = vec![TargetRow::new("row-1")];
        let start = Instant::now();

        for _ in 0..3 {
            extractor.extract(&rows).await.unwrap();
        }

        // 3 submissions at 2/sec: first is immediate, the rest wait
        let elapsed = start.elapsed();
        assert!(
            elapsed.as_millis() >= 500,
            "rate limiting not applied: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_name_passthrough() {
        let extractor = MockExtractor::new().rate_limited_with_burst(5, 10);
        assert_eq!(extractor.name(), "mock");
    }
}
