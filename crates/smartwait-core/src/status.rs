use serde::{Deserialize, Serialize};

/// Lifecycle state of a wait job.
///
/// A job is born `Watching` and transitions to exactly one of the terminal
/// variants; it never re-enters `Watching` afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Still polling for the condition.
    Watching,
    /// The Vision Adapter confirmed the condition.
    Resolved,
    /// The deadline elapsed before the condition was confirmed.
    Timeout,
    /// Cancelled by an explicit `cancel` call.
    Cancelled,
    /// An evaluation raised an unexpected error.
    Error,
}

impl JobStatus {
    /// Whether this status is one of the terminal states.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Watching)
    }

    /// Lowercase label used in wake text and log fields (e.g. `"resolved"`).
    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Watching => "watching",
            JobStatus::Resolved => "resolved",
            JobStatus::Timeout => "timeout",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Error => "error",
        }
    }
}
