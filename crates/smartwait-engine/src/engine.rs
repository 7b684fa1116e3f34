use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;

use smartwait_core::{EngineConfig, JobId, JobStatus, Target};

use crate::adapters::{Capture, TaskSink, VisionAdapter, WakeNotifier};
use crate::api::{EngineEvent, EngineHandle, JobSnapshot, RegisterRequest, UpdateRequest};
use crate::arbiter::CaptureArbiter;
use crate::diffgate::DiffGate;
use crate::error::EngineError;
use crate::job::ActiveJob;
use crate::store::{ActiveRecord, Store, TerminalRecord};
use crate::verdict::{parse_verdict, VerdictStatus};

pub(crate) struct EngineInner {
    event_tx: broadcast::Sender<EngineEvent>,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl EngineInner {
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

pub(crate) enum ControlCommand {
    Register {
        req: RegisterRequest,
        resp: oneshot::Sender<Result<JobId, EngineError>>,
    },
    Status {
        id: Option<JobId>,
        resp: oneshot::Sender<Result<Vec<JobSnapshot>, EngineError>>,
    },
    Update {
        id: JobId,
        req: UpdateRequest,
        resp: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        id: JobId,
        reason: Option<String>,
        resp: oneshot::Sender<Result<(), EngineError>>,
    },
}

enum EvalOutcome {
    Resolved {
        id: JobId,
        detail: String,
        diff_state: DiffGate,
    },
    Rescheduled {
        id: JobId,
        detail: String,
        diff_state: DiffGate,
    },
}

async fn evaluate_job(
    id: JobId,
    display: String,
    target: Target,
    criteria: String,
    mut diff_state: DiffGate,
    arbiter: Arc<CaptureArbiter>,
    capture: Arc<dyn Capture>,
    vision: Arc<dyn VisionAdapter>,
) -> EvalOutcome {
    let frame_result = {
        let _guard = arbiter.acquire(&display).await;
        capture.capture(&display, &target).await
    };

    let frame = match frame_result {
        Ok(frame) => frame,
        Err(err) => {
            return EvalOutcome::Rescheduled {
                id,
                detail: format!("capture failed: {err}"),
                diff_state,
            }
        }
    };

    if !diff_state.should_evaluate(&frame) {
        return EvalOutcome::Rescheduled {
            id,
            detail: "no visible change".to_string(),
            diff_state,
        };
    }

    let reply = match vision.ask(&frame, &criteria).await {
        Ok(reply) => reply,
        Err(err) => {
            return EvalOutcome::Rescheduled {
                id,
                detail: format!("vision call failed: {err}"),
                diff_state,
            }
        }
    };

    let verdict = parse_verdict(&reply);
    match verdict.status {
        VerdictStatus::Resolved => EvalOutcome::Resolved {
            id,
            detail: verdict.detail,
            diff_state,
        },
        VerdictStatus::Watching => EvalOutcome::Rescheduled {
            id,
            detail: verdict.detail,
            diff_state,
        },
    }
}

struct EngineRuntime {
    cfg: EngineConfig,
    capture: Arc<dyn Capture>,
    vision: Arc<dyn VisionAdapter>,
    wake: Arc<dyn WakeNotifier>,
    task_sink: Arc<dyn TaskSink>,
    store: Arc<dyn Store>,
    arbiter: Arc<CaptureArbiter>,

    active: HashMap<JobId, ActiveJob>,
    /// Every id the engine has ever registered, so `update`/`cancel` on an
    /// id that already went terminal can be told apart from one that was
    /// never registered at all (§8 property 10).
    known_ids: HashSet<JobId>,

    cmd_rx: mpsc::Receiver<ControlCommand>,
    eval_tasks: JoinSet<EvalOutcome>,
    task_ids: HashMap<tokio::task::Id, JobId>,

    inner: Arc<EngineInner>,
}

impl EngineRuntime {
    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn warn(&self, message: String) {
        tracing::warn!(message = %message, "engine warning");
        self.emit(EngineEvent::Warning { message });
    }

    fn snapshot_of(&self, job: &ActiveJob) -> JobSnapshot {
        JobSnapshot {
            id: job.id,
            status: JobStatus::Watching,
            elapsed_s: (Utc::now() - job.created_at).num_seconds().max(0),
            target: job.target.clone(),
            criteria: job.criteria.clone(),
            last_detail: job.last_detail.clone(),
            timeout_s: job.timeout_s,
            task_id: job.task_id.clone(),
        }
    }

    async fn register(&mut self, req: RegisterRequest) -> Result<JobId, EngineError> {
        if req.criteria.trim().is_empty() {
            return Err(EngineError::InvalidArg("criteria must not be empty".to_string()));
        }
        if req.display.trim().is_empty() {
            return Err(EngineError::InvalidArg("display must not be empty".to_string()));
        }
        let timeout_s = match req.timeout_s {
            Some(t) if t > 0 => t,
            Some(_) => return Err(EngineError::InvalidArg("timeout_s must be positive".to_string())),
            None => self.cfg.default_timeout.as_secs() as i64,
        };
        let requested_poll = req
            .poll_interval_s
            .map(Duration::from_secs_f64)
            .unwrap_or(self.cfg.min_poll);
        let poll_interval = self.cfg.clamp_poll(requested_poll);

        let id = JobId::new();
        let now = Utc::now();
        let job = ActiveJob {
            id,
            target: req.target.clone(),
            display: req.display.clone(),
            criteria: req.criteria.clone(),
            created_at: now,
            timeout_s,
            poll_interval_s: poll_interval.as_secs_f64(),
            next_check_at: now,
            last_detail: String::new(),
            diff_state: DiffGate::new(&self.cfg),
            task_id: req.task_id.clone(),
            evaluating: false,
        };

        let record = ActiveRecord {
            id,
            created_at: now,
            target: req.target,
            display: req.display,
            criteria: req.criteria,
            timeout_s,
            task_id: req.task_id,
        };
        if let Err(err) = self.store.insert_active(record).await {
            self.warn(format!("failed to persist job {id} creation: {err}"));
        }

        self.known_ids.insert(id);
        self.active.insert(id, job);
        self.emit(EngineEvent::JobRegistered { id });
        tracing::info!(job_id = %id, "job registered");
        Ok(id)
    }

    fn status(&self, id: Option<JobId>) -> Result<Vec<JobSnapshot>, EngineError> {
        match id {
            Some(id) => {
                let job = self.active.get(&id).ok_or(EngineError::NotFound(id))?;
                Ok(vec![self.snapshot_of(job)])
            }
            None => Ok(self.active.values().map(|job| self.snapshot_of(job)).collect()),
        }
    }

    fn update(&mut self, id: JobId, req: UpdateRequest) -> Result<(), EngineError> {
        if !self.active.contains_key(&id) {
            return Err(if self.known_ids.contains(&id) {
                EngineError::AlreadyTerminal(id)
            } else {
                EngineError::NotFound(id)
            });
        }
        if let Some(timeout_s) = req.timeout_s {
            if timeout_s <= 0 {
                return Err(EngineError::InvalidArg("timeout_s must be positive".to_string()));
            }
        }

        let job = self.active.get_mut(&id).expect("checked above");
        if let Some(criteria) = req.criteria {
            job.criteria = criteria;
        }
        if let Some(timeout_s) = req.timeout_s {
            job.created_at = Utc::now();
            job.timeout_s = timeout_s;
        }
        if let Some(note) = req.note {
            job.last_detail = format!("{} (note: {note})", job.last_detail);
        }
        Ok(())
    }

    fn cancel(&mut self, id: JobId, reason: Option<String>) -> Result<(), EngineError> {
        if !self.known_ids.contains(&id) {
            return Err(EngineError::NotFound(id));
        }
        if !self.active.contains_key(&id) {
            return Ok(());
        }
        let detail = reason.unwrap_or_else(|| "(no reason)".to_string());
        self.transition_terminal(id, JobStatus::Cancelled, detail);
        Ok(())
    }

    async fn handle_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Register { req, resp } => {
                let result = self.register(req).await;
                let _ = resp.send(result);
            }
            ControlCommand::Status { id, resp } => {
                let _ = resp.send(self.status(id));
            }
            ControlCommand::Update { id, req, resp } => {
                let _ = resp.send(self.update(id, req));
            }
            ControlCommand::Cancel { id, reason, resp } => {
                let result = self.cancel(id, reason);
                let _ = resp.send(result);
            }
        }
    }

    /// The serialized terminal-transition path (§4.5). `self.active.remove`
    /// is the single synchronization point: if `id` is no longer present,
    /// some earlier call already won the race and this is a no-op.
    ///
    /// The Store commit, Task Sink posts, and Wake Notifier call are pushed
    /// onto their own task rather than awaited here — the Wake Notifier seam
    /// must not block the control loop (§6), and awaiting them inline would
    /// stall every other job's due/timeout check for as long as the slowest
    /// one takes.
    fn transition_terminal(&mut self, id: JobId, status: JobStatus, detail: String) {
        let Some(job) = self.active.remove(&id) else {
            return;
        };

        tracing::info!(job_id = %id, status = status.label(), display = %job.display, "job reached terminal state");
        self.emit(EngineEvent::JobTerminal {
            id,
            status,
            detail: detail.clone(),
        });

        tokio::spawn(notify_terminal(
            job,
            id,
            status,
            detail,
            self.store.clone(),
            self.task_sink.clone(),
            self.wake.clone(),
            self.cfg.wake_notify_timeout,
            self.cfg.wake_state_prefix.clone(),
            self.inner.event_tx.clone(),
        ));
    }

    fn next_wake_time(&self) -> Option<DateTime<Utc>> {
        self.active
            .values()
            .filter(|job| !job.evaluating)
            .map(|job| job.next_check_at.min(job.deadline()))
            .min()
    }

    fn spawn_evaluation(&mut self, id: JobId) {
        let Some(job) = self.active.get_mut(&id) else {
            return;
        };
        job.evaluating = true;
        let diff_state = std::mem::replace(&mut job.diff_state, DiffGate::new(&self.cfg));
        let display = job.display.clone();
        let target = job.target.clone();
        let criteria = job.criteria.clone();

        let arbiter = self.arbiter.clone();
        let capture = self.capture.clone();
        let vision = self.vision.clone();

        let abort = self
            .eval_tasks
            .spawn(evaluate_job(id, display, target, criteria, diff_state, arbiter, capture, vision));
        self.task_ids.insert(abort.id(), id);
    }

    fn dispatch_due_and_timeouts(&mut self) {
        let now = Utc::now();

        // A job whose evaluation is in flight is never timed out here — if
        // its deadline has passed, `handle_eval_result` applies the timeout
        // once that evaluation returns, so a `resolved` verdict racing the
        // deadline still wins (spec §4.5 failure semantics).
        let timed_out: Vec<JobId> = self
            .active
            .iter()
            .filter(|(_, job)| !job.evaluating && job.is_timed_out(now))
            .map(|(id, _)| *id)
            .collect();
        for id in timed_out {
            let detail = self.active.get(&id).map(|job| job.last_detail.clone()).unwrap_or_default();
            self.transition_terminal(id, JobStatus::Timeout, detail);
        }

        let due: Vec<JobId> = self
            .active
            .iter()
            .filter(|(_, job)| job.is_due(now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.spawn_evaluation(id);
        }
    }

    fn handle_eval_result(&mut self, task_id: tokio::task::Id, res: Result<EvalOutcome, tokio::task::JoinError>) {
        match res {
            Ok(EvalOutcome::Resolved { id, detail, diff_state }) => {
                self.task_ids.remove(&task_id);
                if let Some(job) = self.active.get_mut(&id) {
                    job.diff_state = diff_state;
                    job.evaluating = false;
                }
                // A resolved verdict wins even if the deadline elapsed while
                // this evaluation was in flight (spec §4.5).
                self.transition_terminal(id, JobStatus::Resolved, detail);
            }
            Ok(EvalOutcome::Rescheduled { id, detail, diff_state }) => {
                self.task_ids.remove(&task_id);
                let now = Utc::now();
                let timed_out = self.active.get(&id).is_some_and(|job| job.is_timed_out(now));
                if let Some(job) = self.active.get_mut(&id) {
                    job.diff_state = diff_state;
                    job.last_detail = detail.clone();
                    job.evaluating = false;
                    let interval = self.cfg.clamp_poll(Duration::from_secs_f64(job.poll_interval_s));
                    job.next_check_at = now + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::seconds(1));
                }
                // The deadline may have passed while this evaluation was in
                // flight; only now — after it had its chance to resolve —
                // does the timeout take effect.
                if timed_out {
                    self.transition_terminal(id, JobStatus::Timeout, detail);
                }
            }
            Err(join_err) => {
                if let Some(id) = self.task_ids.remove(&task_id) {
                    let message = format!("evaluation task failed: {join_err}");
                    tracing::error!(job_id = %id, error = %message, "evaluation panicked");
                    self.transition_terminal(id, JobStatus::Error, message);
                }
            }
        }
    }

    async fn run(mut self) {
        self.emit(EngineEvent::Started);
        tracing::info!("engine started");

        loop {
            self.dispatch_due_and_timeouts();

            if self.inner.should_stop() {
                break;
            }

            let sleep_dur = match self.next_wake_time() {
                Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => Duration::from_secs(3600),
            };
            let sleep = tokio::time::sleep(sleep_dur);
            tokio::pin!(sleep);

            tokio::select! {
                _ = &mut sleep => {}
                _ = self.inner.notify.notified() => {}
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => self.inner.request_stop(),
                    }
                }
                res = self.eval_tasks.join_next_with_id(), if !self.eval_tasks.is_empty() => {
                    match res {
                        Some(Ok((task_id, outcome))) => self.handle_eval_result(task_id, Ok(outcome)),
                        Some(Err(join_err)) => {
                            let task_id = join_err.id();
                            self.handle_eval_result(task_id, Err(join_err));
                        }
                        None => {}
                    }
                }
            }
        }

        self.eval_tasks.abort_all();
        while self.eval_tasks.join_next().await.is_some() {}

        self.emit(EngineEvent::Stopped);
        tracing::info!("engine stopped");
    }
}

fn wake_text(prefix: &str, job: &ActiveJob, status: JobStatus, detail: &str) -> String {
    match status {
        JobStatus::Resolved => format!("[{prefix} resolved] {}: {} → {detail}", job.id, job.criteria),
        JobStatus::Timeout => format!(
            "[{prefix} timeout] {}: {} — Timeout after {}s. Last observation: {detail}",
            job.id, job.criteria, job.timeout_s
        ),
        JobStatus::Cancelled => format!("[{prefix} cancelled] {}: {} — {detail}", job.id, job.criteria),
        JobStatus::Error => format!("[{prefix} error] {}: {} — {detail}", job.id, job.criteria),
        JobStatus::Watching => unreachable!("watching is not a terminal status"),
    }
}

fn warn_event(event_tx: &broadcast::Sender<EngineEvent>, message: String) {
    tracing::warn!(message = %message, "engine warning");
    let _ = event_tx.send(EngineEvent::Warning { message });
}

/// Commits a job's terminal record and fires its Task Sink/Wake Notifier
/// calls. Runs on its own task (spawned by `transition_terminal`) so a slow
/// notifier never stalls the scheduler's `select!` loop.
#[allow(clippy::too_many_arguments)]
async fn notify_terminal(
    job: ActiveJob,
    id: JobId,
    status: JobStatus,
    detail: String,
    store: Arc<dyn Store>,
    task_sink: Arc<dyn TaskSink>,
    wake: Arc<dyn WakeNotifier>,
    wake_notify_timeout: Duration,
    wake_state_prefix: String,
    event_tx: broadcast::Sender<EngineEvent>,
) {
    let now = Utc::now();

    let record = TerminalRecord {
        id,
        created_at: job.created_at,
        target: job.target.clone(),
        criteria: job.criteria.clone(),
        timeout_s: job.timeout_s,
        status,
        detail: detail.clone(),
        resolved_at: now,
        task_id: job.task_id.clone(),
    };
    if let Err(err) = store.commit_terminal(record).await {
        warn_event(&event_tx, format!("failed to commit terminal record for job {id}: {err}"));
    }

    if let Some(task_id) = &job.task_id {
        let content = format!("Wait {}: {} → {detail}", status.label(), job.criteria);
        task_sink.post_wait_message(task_id, status, &content).await;
        task_sink.update_wait_state(task_id, id, status, now).await;
    }

    let text = wake_text(&wake_state_prefix, &job, status, &detail);
    if tokio::time::timeout(wake_notify_timeout, wake.notify(&text)).await.is_err() {
        warn_event(&event_tx, format!("wake notifier timed out for job {id}"));
    }
}

pub(crate) fn start_engine(
    cfg: EngineConfig,
    capture: Arc<dyn Capture>,
    vision: Arc<dyn VisionAdapter>,
    wake: Arc<dyn WakeNotifier>,
    task_sink: Arc<dyn TaskSink>,
    store: Arc<dyn Store>,
) -> EngineHandle {
    let (event_tx, _) = broadcast::channel(1024);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let inner = Arc::new(EngineInner {
        event_tx,
        stop_requested: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });

    let join = tokio::spawn(run_engine(cfg, capture, vision, wake, task_sink, store, cmd_rx, inner.clone()));
    EngineHandle::new(inner, cmd_tx, join)
}

async fn run_engine(
    cfg: EngineConfig,
    capture: Arc<dyn Capture>,
    vision: Arc<dyn VisionAdapter>,
    wake: Arc<dyn WakeNotifier>,
    task_sink: Arc<dyn TaskSink>,
    store: Arc<dyn Store>,
    cmd_rx: mpsc::Receiver<ControlCommand>,
    inner: Arc<EngineInner>,
) -> anyhow::Result<()> {
    let cfg = cfg.normalized();

    let orphaned = match store.take_orphaned().await {
        Ok(orphaned) => orphaned,
        Err(err) => {
            tracing::warn!(error = %err, "failed to read orphaned jobs from store");
            Vec::new()
        }
    };

    let mut runtime = EngineRuntime {
        cfg,
        capture,
        vision,
        wake,
        task_sink,
        store,
        arbiter: Arc::new(CaptureArbiter::new()),
        active: HashMap::new(),
        known_ids: HashSet::new(),
        cmd_rx,
        eval_tasks: JoinSet::new(),
        task_ids: HashMap::new(),
        inner,
    };

    // Crash recovery (§6, §8 property 11): jobs active in a previous run are
    // marked terminal `error` with no wake, never resumed.
    for record in orphaned {
        runtime.known_ids.insert(record.id);
        let detail = "daemon restarted while watching".to_string();
        let job_id = record.id;
        let terminal = TerminalRecord {
            id: record.id,
            created_at: record.created_at,
            target: record.target,
            criteria: record.criteria,
            timeout_s: record.timeout_s,
            status: JobStatus::Error,
            detail: detail.clone(),
            resolved_at: Utc::now(),
            task_id: record.task_id,
        };
        if let Err(err) = runtime.store.commit_terminal(terminal).await {
            runtime.warn(format!("failed to commit orphan terminal record for {job_id}: {err}"));
        }
        tracing::warn!(job_id = %job_id, "orphaned job from previous run marked error");
        runtime.emit(EngineEvent::JobTerminal {
            id: job_id,
            status: JobStatus::Error,
            detail,
        });
    }

    runtime.run().await;
    Ok(())
}
