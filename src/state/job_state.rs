//! Job status state machine
//!
//! Job states: PENDING → RUNNING → {COMPLETED | FAILED}
//!
//! There is no edge back to PENDING, no edge that skips RUNNING, and no edge
//! out of a terminal state.

use serde::{Deserialize, Serialize};

use super::TerminalState;

/// Job status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue
    Pending,
    /// Holding the resource and executing
    Running,
    /// Exited successfully
    Completed,
    /// Exited abnormally, or could not be started
    Failed,
}

impl TerminalState for JobStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl JobStatus {
    /// Every status, in lifecycle order
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Check if transition from this status to target is valid
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// Whether `started_at` must be set in this status
    pub fn has_started(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }

    /// Storage / display name
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(StatusParseError(s.to_string())),
        }
    }
}

/// Unknown status name
#[derive(Debug, thiserror::Error)]
#[error("unknown job status '{0}' (expected pending, running, completed or failed)")]
pub struct StatusParseError(pub String);
