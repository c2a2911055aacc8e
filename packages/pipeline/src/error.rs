//! Typed errors for the batch pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or empty input at split time. Never retried; no partial
    /// job is persisted when this is raised.
    #[error("validation error: {reason}")]
    Validation { reason: String },

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Job not found in store
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: Uuid },

    /// Batch not found in store
    #[error("batch not found: {batch_id}")]
    BatchNotFound { batch_id: Uuid },

    /// Input or output fragment missing from the fragment store
    #[error("fragment not found: {fragment_ref}")]
    FragmentNotFound { fragment_ref: String },

    /// A persisted fragment is unreadable or its content hash does not
    /// match. Aborts the merge; batch state is left intact for inspection.
    #[error("integrity error in {fragment_ref}: {reason}")]
    Integrity {
        fragment_ref: String,
        reason: String,
    },

    /// Attempted a state transition the lifecycle does not allow
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Extraction service failure surfaced past the retry ceiling
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Filesystem error from the fragment store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

/// Errors returned by the external extraction service.
///
/// The split between transient and permanent is what drives the retry
/// loop: transient failures re-arm the batch until the ceiling is hit,
/// permanent failures exhaust the batch's retries immediately.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Recoverable failure (network, rate limit, timeout)
    #[error("transient extraction error: {0}")]
    Transient(String),

    /// Unrecoverable failure (malformed batch content)
    #[error("permanent extraction error: {0}")]
    Permanent(String),
}

impl ExtractError {
    /// Whether this failure is eligible for another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractError::Transient(_))
    }

    /// The failure message without the taxonomy prefix.
    pub fn message(&self) -> &str {
        match self {
            ExtractError::Transient(msg) | ExtractError::Permanent(msg) => msg,
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for extraction calls.
pub type ExtractResult<T> = std::result::Result<T, ExtractError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExtractError::Transient("timeout".into()).is_transient());
        assert!(!ExtractError::Permanent("bad input".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::Validation {
            reason: "empty input".into(),
        };
        assert_eq!(err.to_string(), "validation error: empty input");

        let err = PipelineError::Integrity {
            fragment_ref: "job_x/outputs/batch_0001_output.json".into(),
            reason: "content hash mismatch".into(),
        };
        assert!(err.to_string().contains("batch_0001"));
    }
}
