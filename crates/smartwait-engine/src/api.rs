//! Public API types for the smart-wait engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use smartwait_core::{EngineConfig, JobId, JobStatus, Target};

use crate::adapters::{Capture, TaskSink, VisionAdapter, WakeNotifier};
use crate::engine::{ControlCommand, EngineInner};
use crate::error::EngineError;
use crate::store::Store;

/// A caller's request to register a new wait job (§4.1, §6).
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// What to capture.
    pub target: Target,
    /// Which display to capture from.
    pub display: String,
    /// Natural-language wait condition.
    pub criteria: String,
    /// Timeout in seconds; `None` falls back to the engine's configured
    /// `default_timeout`.
    pub timeout_s: Option<i64>,
    /// Requested base polling period in seconds, clamped to
    /// `[min_poll, max_poll]`; `None` falls back to `min_poll`.
    pub poll_interval_s: Option<f64>,
    /// Optional linked external task, for auto-reporting.
    pub task_id: Option<String>,
}

/// A caller's request to refine an in-flight job (§4.1).
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Replace the wait condition.
    pub criteria: Option<String>,
    /// Reset the deadline to `now + timeout_s`.
    pub timeout_s: Option<i64>,
    /// Append a note to the job's detail history.
    pub note: Option<String>,
}

/// A point-in-time view of a job, returned by `status` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSnapshot {
    /// The job's identifier.
    pub id: JobId,
    /// Current status (always `Watching` — terminal jobs leave the active set).
    pub status: JobStatus,
    /// Seconds elapsed since registration.
    pub elapsed_s: i64,
    /// Capture target.
    pub target: Target,
    /// Natural-language wait condition.
    pub criteria: String,
    /// Most recent observation text.
    pub last_detail: String,
    /// Configured timeout, in seconds.
    pub timeout_s: i64,
    /// Optional linked external task.
    pub task_id: Option<String>,
}

/// Typed feed of what the scheduler is doing, job by job (§A.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// The engine's scheduler loop started.
    Started,
    /// A new job was accepted.
    JobRegistered {
        /// The job's identifier.
        id: JobId,
    },
    /// A job reached a terminal state and was notified.
    JobTerminal {
        /// The job's identifier.
        id: JobId,
        /// Final status.
        status: JobStatus,
        /// Final detail text.
        detail: String,
    },
    /// A non-fatal engine condition worth surfacing.
    Warning {
        /// Warning message.
        message: String,
    },
    /// The engine's scheduler loop stopped.
    Stopped,
}

/// Handle to a running engine instance.
pub struct EngineHandle {
    inner: Arc<EngineInner>,
    cmd_tx: mpsc::Sender<ControlCommand>,
    join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EngineHandle {
    pub(crate) fn new(
        inner: Arc<EngineInner>,
        cmd_tx: mpsc::Sender<ControlCommand>,
        join: tokio::task::JoinHandle<anyhow::Result<()>>,
    ) -> Self {
        Self { inner, cmd_tx, join }
    }

    /// Register a new wait job. Fails `InvalidArg` per §4.1's validation.
    pub async fn register(&self, req: RegisterRequest) -> Result<JobId, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(ControlCommand::Register { req, resp })
            .await
            .map_err(|_| EngineError::ShutDown)?;
        rx.await.map_err(|_| EngineError::ShutDown)?
    }

    /// Return one job's snapshot, or every active job's if `id` is `None`.
    pub async fn status(&self, id: Option<JobId>) -> Result<Vec<JobSnapshot>, EngineError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(ControlCommand::Status { id, resp })
            .await
            .map_err(|_| EngineError::ShutDown)?;
        rx.await.map_err(|_| EngineError::ShutDown)?
    }

    /// Refine an in-flight job's criteria, deadline, or detail history.
    pub async fn update(&self, id: JobId, req: UpdateRequest) -> Result<(), EngineError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(ControlCommand::Update { id, req, resp })
            .await
            .map_err(|_| EngineError::ShutDown)?;
        rx.await.map_err(|_| EngineError::ShutDown)?
    }

    /// Cancel a job. A no-op returning success if it already went terminal.
    pub async fn cancel(&self, id: JobId, reason: Option<String>) -> Result<(), EngineError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(ControlCommand::Cancel { id, reason, resp })
            .await
            .map_err(|_| EngineError::ShutDown)?;
        rx.await.map_err(|_| EngineError::ShutDown)?
    }

    /// Subscribe to the engine's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.subscribe()
    }

    /// Request the scheduler loop to stop. In-flight evaluations are not
    /// awaited; the next loop iteration exits.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the engine's scheduler task to exit.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}

/// Start a new engine instance wired to the given capability seams.
pub fn start_engine(
    cfg: EngineConfig,
    capture: Arc<dyn Capture>,
    vision: Arc<dyn VisionAdapter>,
    wake: Arc<dyn WakeNotifier>,
    task_sink: Arc<dyn TaskSink>,
    store: Arc<dyn Store>,
) -> EngineHandle {
    crate::engine::start_engine(cfg, capture, vision, wake, task_sink, store)
}
