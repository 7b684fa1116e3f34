use chrono::{DateTime, Utc};

use smartwait_core::{JobId, Target};

use crate::diffgate::DiffGate;

/// In-memory record of a single wait (§3). Owned exclusively by the
/// scheduler's active map; nothing else holds a reference to it.
pub struct ActiveJob {
    pub id: JobId,
    pub target: Target,
    pub display: String,
    pub criteria: String,
    pub created_at: DateTime<Utc>,
    pub timeout_s: i64,
    pub poll_interval_s: f64,
    pub next_check_at: DateTime<Utc>,
    pub last_detail: String,
    pub diff_state: DiffGate,
    pub task_id: Option<String>,
    /// Set while an evaluation task for this job is in flight, so the
    /// scheduler never dispatches a second one (§5 ordering guarantees).
    pub evaluating: bool,
}

impl ActiveJob {
    /// The job's absolute deadline.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(self.timeout_s)
    }

    /// Whether `now` is at or past this job's deadline.
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.deadline() <= now
    }

    /// Whether this job is due for evaluation (and not already mid-flight).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.evaluating && self.next_check_at <= now
    }
}
