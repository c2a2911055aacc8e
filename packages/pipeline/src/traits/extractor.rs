//! Extractor trait: the seam to the external extraction service.
//!
//! The pipeline is deliberately ignorant of how extraction works (DOM
//! parsing, API calls, browser automation). It submits a batch of rows
//! and gets back records or a classified error; everything else belongs
//! to the adapter behind this trait.

use async_trait::async_trait;

use crate::error::ExtractResult;
use crate::types::row::{Record, TargetRow};

/// External extraction service contract.
///
/// Implementations classify every failure as transient or permanent:
/// transient failures (network, rate limit, timeout) drive the retry
/// loop, permanent failures (malformed batch content) exhaust the
/// batch's retries immediately.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract records from a batch of target rows.
    ///
    /// The returned records must be in input row order. A row that
    /// legitimately yields nothing may simply be absent; an empty result
    /// for the whole batch is a valid outcome.
    async fn extract(&self, rows: &[TargetRow]) -> ExtractResult<Vec<Record>>;

    /// Adapter name for logging.
    fn name(&self) -> &str {
        "unknown"
    }
}
