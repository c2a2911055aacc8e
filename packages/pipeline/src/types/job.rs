//! Job entity and its forward-only lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Lifecycle status of a job.
///
/// Transitions only move forward: `Pending -> Running -> {Completed,
/// Failed, Cancelled}`. A terminal job is never reopened by the pipeline
/// itself; the single exception is the explicit operator override in
/// [`retry_failed`](crate::pipeline::resume::retry_failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Stable string form used for persistence and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The top-level unit of work: one dataset submission through to a single
/// merged result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    /// Opaque requester identifier (e.g. an email address)
    pub owner: String,

    pub status: JobStatus,

    pub created_at: DateTime<Utc>,

    /// Number of batches the input was split into
    pub total_batches: u32,

    /// Pointer to the original split source (caller-supplied label,
    /// e.g. an upload path)
    pub input_ref: String,

    /// Location of the merged artifact; set only on completion
    pub final_artifact_ref: Option<String>,

    /// Failure summary; set only when the job fails
    pub error: Option<String>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(owner: impl Into<String>, input_ref: impl Into<String>, total_batches: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            total_batches,
            input_ref: input_ref.into(),
            final_artifact_ref: None,
            error: None,
        }
    }

    /// Validate and apply a status transition.
    pub fn transition_to(&mut self, next: JobStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}
