//! Capability seams: the external collaborators the engine drives but does
//! not implement. Embedders provide concrete types; the engine only ever
//! sees `Arc<dyn Trait>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use smartwait_core::{JobId, JobStatus, Target};

use crate::diffgate::Frame;

/// Frame capture failed.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The target (window, pty session) no longer exists.
    #[error("capture target not found: {0}")]
    TargetGone(String),
    /// The underlying capture backend returned an error.
    #[error("capture backend error: {0}")]
    Backend(String),
}

/// Takes a still frame of a [`Target`] on a given `display`.
///
/// Implementations are responsible for their own platform-specific capture
/// mechanism; the engine only ever calls through this trait, and only ever
/// holds one in-flight call per `display` via the [`crate::CaptureArbiter`].
#[async_trait]
pub trait Capture: Send + Sync {
    /// Capture a single frame of `target` on `display`.
    async fn capture(&self, display: &str, target: &Target) -> Result<Frame, CaptureError>;
}

/// The vision model call failed.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    /// The adapter could not reach the backing model at all.
    #[error("vision backend unreachable: {0}")]
    Unreachable(String),
    /// The backing model returned an error response.
    #[error("vision backend error: {0}")]
    Backend(String),
}

/// Asks an external vision model whether `condition` holds in `frame`.
///
/// Returns the model's raw free-form reply; the engine parses it with
/// [`crate::parse_verdict`]. Implementations should not parse the reply
/// themselves — verdict parsing is centralized so every adapter is judged
/// by the same rules.
#[async_trait]
pub trait VisionAdapter: Send + Sync {
    /// Ask whether `condition` is satisfied by the contents of `frame`.
    async fn ask(&self, frame: &Frame, condition: &str) -> Result<String, VisionError>;
}

/// Delivers a job's terminal wake-out text to its waiting consumer.
///
/// This is the engine's only outward notification path; it is called
/// exactly once per job, at the moment the job's state is durably recorded
/// as terminal (§4.5). Implementations must observe their own wall-clock
/// cap and must not propagate blocking failures — the engine additionally
/// bounds the call with `wake_notify_timeout_s` regardless.
#[async_trait]
pub trait WakeNotifier: Send + Sync {
    /// Deliver `text` as a wake-out event.
    async fn notify(&self, text: &str);
}

/// Threads a job's terminal outcome into an external task record (§6).
///
/// A one-way, best-effort sink for the embedder's own task-memory
/// bookkeeping — distinct from [`crate::Store`], which is the engine's own
/// crash-recovery state.
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Post a typed `wait` message with the given content to `task_id`.
    async fn post_wait_message(&self, task_id: &str, status: JobStatus, content: &str);

    /// Remove `job_id` from the task's `active_wait_ids` and record the
    /// latest wait state and event time.
    async fn update_wait_state(&self, task_id: &str, job_id: JobId, last_state: JobStatus, last_event_at: DateTime<Utc>);
}
