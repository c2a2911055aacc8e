//! Batch entity: one fixed-size slice of a job's input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a batch.
///
/// `Pending -> Claimed -> {Completed | Pending (retry) | Failed}`.
/// `Failed` is terminal: a retryable failure returns the batch to
/// `Pending` instead. At most one worker holds a batch in `Claimed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl BatchStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// Stable string form used for persistence and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Claimed => "claimed",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<BatchStatus> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "claimed" => Some(BatchStatus::Claimed),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ordered slice of a job's input.
///
/// Rows are never deleted; they are retained for audit and resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,

    /// Owning job
    pub job_id: Uuid,

    /// 0-based position within the job; defines merge order
    pub index: u32,

    pub status: BatchStatus,

    /// Number of claims made so far. Incremented atomically at claim
    /// time, so `attempt_count <= max_retries + 1` always holds.
    pub attempt_count: u32,

    pub max_retries: u32,

    /// This batch's slice of the split input
    pub input_ref: String,

    /// Extracted records; set on completion
    pub output_ref: Option<String>,

    /// Most recent failure message
    pub last_error: Option<String>,

    /// Worker currently holding the claim
    pub claimed_by: Option<Uuid>,

    /// Earliest time the next claim may happen (backoff gate)
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Create a new pending batch.
    pub fn new(job_id: Uuid, index: u32, input_ref: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            index,
            status: BatchStatus::Pending,
            attempt_count: 0,
            max_retries,
            input_ref: input_ref.into(),
            output_ref: None,
            last_error: None,
            claimed_by: None,
            next_attempt_at: None,
        }
    }

    /// Whether every allowed attempt has been consumed.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_retries + 1
    }

    /// Whether the batch is eligible for a claim at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == BatchStatus::Pending
            && !self.attempts_exhausted()
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}
