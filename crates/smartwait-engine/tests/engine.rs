//! Engine-loop integration tests. Fake seam implementations drive the real
//! `EngineRuntime` through `start_engine`; these assert the testable
//! properties and scenarios, not mechanical round trips.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

use smartwait_engine::{
    start_engine, ActiveRecord, Capture, CaptureError, EngineConfig, EngineEvent, EngineHandle, Frame, JobId,
    JobStatus, RegisterRequest, Store, StoreError, Target, TaskSink, TerminalRecord, UpdateRequest, VisionAdapter,
    VisionError, WakeNotifier,
};

fn fast_config() -> EngineConfig {
    let mut cfg = EngineConfig::defaults();
    cfg.min_poll = Duration::from_millis(10);
    cfg.max_poll = Duration::from_millis(20);
    cfg.default_timeout = Duration::from_secs(60);
    cfg.wake_notify_timeout = Duration::from_secs(1);
    cfg
}

fn solid_frame(shade: u8) -> Frame {
    Frame::new(4, 4, vec![shade; 4 * 4 * 3]).unwrap()
}

/// Captures a solid frame whose shade flips with every call, so the Diff
/// Gate sees a change on every evaluation unless told otherwise.
struct FlippingCapture {
    calls: AtomicUsize,
}

impl FlippingCapture {
    fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capture for FlippingCapture {
    async fn capture(&self, _display: &str, _target: &Target) -> Result<Frame, CaptureError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(solid_frame(if n % 2 == 0 { 10 } else { 240 }))
    }
}

/// Always captures the same frame — the Diff Gate suppresses every call
/// after the first.
struct StillCapture {
    calls: AtomicUsize,
}

impl StillCapture {
    fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capture for StillCapture {
    async fn capture(&self, _display: &str, _target: &Target) -> Result<Frame, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(solid_frame(128))
    }
}

/// Tracks how many captures for a given display are in flight at once, to
/// verify the engine only ever holds one per display (§4.4 exercised
/// end-to-end, distinct from `arbiter.rs`'s own unit tests).
struct OverlapCapture {
    current: Mutex<usize>,
    max_seen: AtomicUsize,
}

impl OverlapCapture {
    fn new() -> Self {
        Self {
            current: Mutex::new(0),
            max_seen: AtomicUsize::new(0),
        }
    }

    fn max_seen(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capture for OverlapCapture {
    async fn capture(&self, _display: &str, _target: &Target) -> Result<Frame, CaptureError> {
        {
            let mut cur = self.current.lock().unwrap();
            *cur += 1;
            self.max_seen.fetch_max(*cur, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        {
            let mut cur = self.current.lock().unwrap();
            *cur -= 1;
        }
        Ok(solid_frame(5))
    }
}

/// Returns scripted replies in order, then repeats the last one.
struct ScriptedVision {
    replies: Vec<&'static str>,
    calls: AtomicUsize,
}

impl ScriptedVision {
    fn new(replies: Vec<&'static str>) -> Self {
        Self { replies, calls: AtomicUsize::new(0) }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionAdapter for ScriptedVision {
    async fn ask(&self, _frame: &Frame, _condition: &str) -> Result<String, VisionError> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.get(i).or_else(|| self.replies.last()).copied().unwrap_or("no");
        Ok(reply.to_string())
    }
}

/// Sleeps past `delay` before answering with a resolved verdict — used to
/// land an in-flight evaluation's completion after a job's deadline has
/// already elapsed.
struct SlowResolvingVision {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowResolvingVision {
    fn new(delay: Duration) -> Self {
        Self { delay, calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl VisionAdapter for SlowResolvingVision {
    async fn ask(&self, _frame: &Frame, _condition: &str) -> Result<String, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok("FINAL_JSON: {\"decision\": \"yes\", \"summary\": \"finished late\"}".to_string())
    }
}

#[derive(Default)]
struct RecordingWake {
    texts: Mutex<Vec<String>>,
}

impl RecordingWake {
    fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl WakeNotifier for RecordingWake {
    async fn notify(&self, text: &str) {
        self.texts.lock().unwrap().push(text.to_string());
    }
}

#[derive(Default)]
struct RecordingTaskSink {
    messages: Mutex<Vec<(String, JobStatus, String)>>,
    state_updates: Mutex<Vec<(String, JobId, JobStatus)>>,
}

#[async_trait]
impl TaskSink for RecordingTaskSink {
    async fn post_wait_message(&self, task_id: &str, status: JobStatus, content: &str) {
        self.messages.lock().unwrap().push((task_id.to_string(), status, content.to_string()));
    }

    async fn update_wait_state(&self, task_id: &str, job_id: JobId, last_state: JobStatus, _last_event_at: DateTime<Utc>) {
        self.state_updates.lock().unwrap().push((task_id.to_string(), job_id, last_state));
    }
}

/// In-memory `Store`, optionally preloaded with leftover active records to
/// simulate a prior unclean shutdown.
#[derive(Default)]
struct FakeStore {
    active: AsyncMutex<BTreeMap<JobId, ActiveRecord>>,
    terminal: Mutex<Vec<TerminalRecord>>,
}

impl FakeStore {
    fn preloaded(records: Vec<ActiveRecord>) -> Self {
        let active = records.into_iter().map(|r| (r.id, r)).collect();
        Self {
            active: AsyncMutex::new(active),
            terminal: Mutex::new(Vec::new()),
        }
    }

    fn terminal_records(&self) -> Vec<TerminalRecord> {
        self.terminal.lock().unwrap().clone()
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn insert_active(&self, record: ActiveRecord) -> Result<(), StoreError> {
        self.active.lock().await.insert(record.id, record);
        Ok(())
    }

    async fn commit_terminal(&self, record: TerminalRecord) -> Result<(), StoreError> {
        self.active.lock().await.remove(&record.id);
        self.terminal.lock().unwrap().push(record);
        Ok(())
    }

    async fn take_orphaned(&self) -> Result<Vec<ActiveRecord>, StoreError> {
        let mut table = self.active.lock().await;
        let orphaned = table.values().cloned().collect();
        table.clear();
        Ok(orphaned)
    }
}

fn start(
    cfg: EngineConfig,
    capture: Arc<dyn Capture>,
    vision: Arc<dyn VisionAdapter>,
    wake: Arc<RecordingWake>,
    task_sink: Arc<RecordingTaskSink>,
    store: Arc<FakeStore>,
) -> EngineHandle {
    start_engine(cfg, capture, vision, wake, task_sink, store)
}

async fn next_terminal(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> (JobId, JobStatus, String) {
    loop {
        match timeout(Duration::from_secs(5), rx.recv()).await.expect("timed out waiting for terminal event") {
            Ok(EngineEvent::JobTerminal { id, status, detail }) => return (id, status, detail),
            Ok(_) => continue,
            Err(err) => panic!("event stream closed: {err}"),
        }
    }
}

/// The `JobTerminal` event fires before its Store/Task Sink/Wake Notifier
/// side effects, which run on a detached task — poll for `cond` instead of
/// asserting on it the instant the event arrives.
async fn wait_for(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not become true in time");
}

/// S1/property 1: a vision reply carrying a `FINAL_JSON` resolved verdict
/// terminates the job as `Resolved` and fires exactly one wake.
#[tokio::test]
async fn resolves_on_final_json_verdict() {
    let capture: Arc<dyn Capture> = Arc::new(FlippingCapture::new());
    let vision: Arc<dyn VisionAdapter> = Arc::new(ScriptedVision::new(vec![
        "FINAL_JSON: {\"decision\": \"yes\", \"summary\": \"build finished\"}",
    ]));
    let wake = Arc::new(RecordingWake::default());
    let task_sink = Arc::new(RecordingTaskSink::default());
    let store = Arc::new(FakeStore::default());

    let handle = start(fast_config(), capture, vision, wake.clone(), task_sink, store);
    let mut events = handle.subscribe();

    let id = handle
        .register(RegisterRequest {
            target: Target::Screen,
            display: ":1".to_string(),
            criteria: "build finished".to_string(),
            timeout_s: None,
            poll_interval_s: None,
            task_id: None,
        })
        .await
        .unwrap();

    let (terminal_id, status, detail) = next_terminal(&mut events).await;
    assert_eq!(terminal_id, id);
    assert_eq!(status, JobStatus::Resolved);
    assert_eq!(detail, "build finished");

    wait_for(|| wake.texts().len() == 1).await;
    assert!(wake.texts()[0].contains("resolved"));

    handle.request_stop();
    handle.wait().await.unwrap();
}

/// S2/property: a job whose deadline elapses before resolution terminates
/// as `Timeout`, independent of what the vision adapter says.
#[tokio::test]
async fn terminates_on_timeout() {
    let capture: Arc<dyn Capture> = Arc::new(FlippingCapture::new());
    let vision: Arc<dyn VisionAdapter> = Arc::new(ScriptedVision::new(vec!["still building"]));
    let wake = Arc::new(RecordingWake::default());
    let task_sink = Arc::new(RecordingTaskSink::default());
    let store = Arc::new(FakeStore::default());

    let mut cfg = fast_config();
    cfg.default_timeout = Duration::from_millis(50);

    let handle = start(cfg, capture, vision, wake.clone(), task_sink, store);
    let mut events = handle.subscribe();

    let id = handle
        .register(RegisterRequest {
            target: Target::Screen,
            display: ":1".to_string(),
            criteria: "never happens".to_string(),
            timeout_s: None,
            poll_interval_s: None,
            task_id: None,
        })
        .await
        .unwrap();

    let (terminal_id, status, _detail) = next_terminal(&mut events).await;
    assert_eq!(terminal_id, id);
    assert_eq!(status, JobStatus::Timeout);
    wait_for(|| wake.texts().len() == 1).await;
    assert!(wake.texts()[0].contains("timeout"));

    handle.request_stop();
    handle.wait().await.unwrap();
}

/// Property 10: cancelling a job is idempotent once it's gone terminal, but
/// an id that was never registered is always `NotFound`.
#[tokio::test]
async fn cancel_is_idempotent_after_terminal_and_rejects_unknown_ids() {
    let capture: Arc<dyn Capture> = Arc::new(FlippingCapture::new());
    let vision: Arc<dyn VisionAdapter> = Arc::new(ScriptedVision::new(vec!["still waiting"]));
    let wake = Arc::new(RecordingWake::default());
    let task_sink = Arc::new(RecordingTaskSink::default());
    let store = Arc::new(FakeStore::default());

    let handle = start(fast_config(), capture, vision, wake, task_sink, store);
    let mut events = handle.subscribe();

    let id = handle
        .register(RegisterRequest {
            target: Target::Screen,
            display: ":1".to_string(),
            criteria: "anything".to_string(),
            timeout_s: None,
            poll_interval_s: None,
            task_id: None,
        })
        .await
        .unwrap();

    handle.cancel(id, Some("no longer needed".to_string())).await.unwrap();
    let (terminal_id, status, _) = next_terminal(&mut events).await;
    assert_eq!(terminal_id, id);
    assert_eq!(status, JobStatus::Cancelled);

    // Cancelling again is a no-op success, not an error.
    handle.cancel(id, None).await.unwrap();

    // An id that was never registered is always NotFound.
    let unknown = JobId::new();
    assert!(matches!(handle.cancel(unknown, None).await, Err(smartwait_engine::EngineError::NotFound(_))));
    assert!(matches!(
        handle.update(unknown, UpdateRequest::default()).await,
        Err(smartwait_engine::EngineError::NotFound(_))
    ));

    // But update on the now-terminal job reports AlreadyTerminal, not NotFound.
    assert!(matches!(
        handle.update(id, UpdateRequest::default()).await,
        Err(smartwait_engine::EngineError::AlreadyTerminal(_))
    ));

    handle.request_stop();
    handle.wait().await.unwrap();
}

/// Property: an unchanged frame suppresses the vision call entirely — the
/// Diff Gate only lets the first evaluation through.
#[tokio::test]
async fn diff_gate_suppresses_vision_calls_on_unchanged_frames() {
    let capture = Arc::new(StillCapture::new());
    let vision = Arc::new(ScriptedVision::new(vec!["not yet"]));
    let wake = Arc::new(RecordingWake::default());
    let task_sink = Arc::new(RecordingTaskSink::default());
    let store = Arc::new(FakeStore::default());

    let handle = start(
        fast_config(),
        capture.clone() as Arc<dyn Capture>,
        vision.clone() as Arc<dyn VisionAdapter>,
        wake,
        task_sink,
        store,
    );

    handle
        .register(RegisterRequest {
            target: Target::Screen,
            display: ":1".to_string(),
            criteria: "never changes".to_string(),
            timeout_s: None,
            poll_interval_s: None,
            task_id: None,
        })
        .await
        .unwrap();

    // Let several poll cycles elapse.
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(capture.calls() > 1, "expected multiple capture attempts, got {}", capture.calls());
    assert_eq!(vision.calls(), 1, "diff gate should suppress every call after the first");

    handle.request_stop();
    handle.wait().await.unwrap();
}

/// §4.4: two jobs on the same display never have overlapping captures.
#[tokio::test]
async fn capture_arbiter_serializes_same_display_jobs() {
    let capture = Arc::new(OverlapCapture::new());
    let vision: Arc<dyn VisionAdapter> = Arc::new(ScriptedVision::new(vec!["still waiting"]));
    let wake = Arc::new(RecordingWake::default());
    let task_sink = Arc::new(RecordingTaskSink::default());
    let store = Arc::new(FakeStore::default());

    let handle = start(fast_config(), capture.clone() as Arc<dyn Capture>, vision, wake, task_sink, store);

    for _ in 0..2 {
        handle
            .register(RegisterRequest {
                target: Target::Screen,
                display: ":shared".to_string(),
                criteria: "anything".to_string(),
                timeout_s: None,
                poll_interval_s: None,
                task_id: None,
            })
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(capture.max_seen(), 1, "captures on the same display must never overlap");

    handle.request_stop();
    handle.wait().await.unwrap();
}

/// Property 11: a job left active by a previous run is recovered as
/// terminal `Error` on startup, with no wake notification sent for it.
#[tokio::test]
async fn recovers_orphaned_jobs_as_error_without_waking() {
    let orphan_id = JobId::new();
    let store = Arc::new(FakeStore::preloaded(vec![ActiveRecord {
        id: orphan_id,
        created_at: Utc::now(),
        target: Target::Screen,
        display: ":1".to_string(),
        criteria: "leftover from last run".to_string(),
        timeout_s: 300,
        task_id: None,
    }]));

    let capture: Arc<dyn Capture> = Arc::new(FlippingCapture::new());
    let vision: Arc<dyn VisionAdapter> = Arc::new(ScriptedVision::new(vec!["n/a"]));
    let wake = Arc::new(RecordingWake::default());
    let task_sink = Arc::new(RecordingTaskSink::default());

    let handle = start(fast_config(), capture, vision, wake.clone(), task_sink, store.clone());
    let mut events = handle.subscribe();

    let (terminal_id, status, _) = next_terminal(&mut events).await;
    assert_eq!(terminal_id, orphan_id);
    assert_eq!(status, JobStatus::Error);

    assert!(wake.texts().is_empty(), "orphan recovery must not notify the wake seam");
    assert_eq!(store.terminal_records().len(), 1);
    assert_eq!(store.terminal_records()[0].id, orphan_id);

    handle.request_stop();
    handle.wait().await.unwrap();
}

/// §6 Task Sink contract: both hooks fire exactly once, at the terminal
/// transition, for a job registered with a `task_id`.
#[tokio::test]
async fn task_sink_hooks_fire_once_on_terminal_transition() {
    let capture: Arc<dyn Capture> = Arc::new(FlippingCapture::new());
    let vision: Arc<dyn VisionAdapter> = Arc::new(ScriptedVision::new(vec![
        "FINAL_JSON: {\"decision\": \"yes\"}",
    ]));
    let wake = Arc::new(RecordingWake::default());
    let task_sink = Arc::new(RecordingTaskSink::default());
    let store = Arc::new(FakeStore::default());

    let handle = start(fast_config(), capture, vision, wake, task_sink.clone(), store);
    let mut events = handle.subscribe();

    let id = handle
        .register(RegisterRequest {
            target: Target::Screen,
            display: ":1".to_string(),
            criteria: "linked task".to_string(),
            timeout_s: None,
            poll_interval_s: None,
            task_id: Some("task-42".to_string()),
        })
        .await
        .unwrap();

    let (terminal_id, status, _) = next_terminal(&mut events).await;
    assert_eq!(terminal_id, id);
    assert_eq!(status, JobStatus::Resolved);

    wait_for(|| task_sink.messages.lock().unwrap().len() == 1).await;
    wait_for(|| task_sink.state_updates.lock().unwrap().len() == 1).await;
    assert_eq!(task_sink.state_updates.lock().unwrap()[0].1, id);

    handle.request_stop();
    handle.wait().await.unwrap();
}

/// spec.md:153 / Finding: a deadline that elapses while an evaluation is
/// in flight must not preempt a `Resolved` outcome that arrives afterward —
/// the in-flight call is allowed to finish and its verdict wins.
#[tokio::test]
async fn in_flight_resolution_wins_over_timeout() {
    let capture: Arc<dyn Capture> = Arc::new(FlippingCapture::new());
    let vision: Arc<dyn VisionAdapter> = Arc::new(SlowResolvingVision::new(Duration::from_millis(150)));
    let wake = Arc::new(RecordingWake::default());
    let task_sink = Arc::new(RecordingTaskSink::default());
    let store = Arc::new(FakeStore::default());

    let mut cfg = fast_config();
    cfg.default_timeout = Duration::from_millis(50);

    let handle = start(cfg, capture, vision, wake.clone(), task_sink, store);
    let mut events = handle.subscribe();

    let id = handle
        .register(RegisterRequest {
            target: Target::Screen,
            display: ":1".to_string(),
            criteria: "finishes late".to_string(),
            timeout_s: None,
            poll_interval_s: None,
            task_id: None,
        })
        .await
        .unwrap();

    // The job's 50ms deadline elapses well before the vision call returns
    // at ~150ms; the scheduler must not time it out while it's in flight.
    let (terminal_id, status, detail) = next_terminal(&mut events).await;
    assert_eq!(terminal_id, id);
    assert_eq!(status, JobStatus::Resolved);
    assert_eq!(detail, "finished late");

    handle.request_stop();
    handle.wait().await.unwrap();
}
