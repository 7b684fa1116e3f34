use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use smartwait_core::{JobId, JobStatus, Target};

/// Store I/O failed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying file could not be read or written.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    /// The on-disk JSON did not parse.
    #[error("store decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A job's creation, recorded at `register` time so a crash can be
/// recognized as having interrupted it (§6, §7, §8 property 11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveRecord {
    /// The job's identifier.
    pub id: JobId,
    /// When the job was registered.
    pub created_at: DateTime<Utc>,
    /// Capture target.
    pub target: Target,
    /// Display the target was captured from.
    pub display: String,
    /// Natural-language wait condition.
    pub criteria: String,
    /// Configured timeout, in seconds.
    pub timeout_s: i64,
    /// Optional linked external task.
    pub task_id: Option<String>,
}

/// A job's final outcome, written exactly once per job (§3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRecord {
    /// The job's identifier.
    pub id: JobId,
    /// When the job was registered.
    pub created_at: DateTime<Utc>,
    /// Capture target.
    pub target: Target,
    /// Natural-language wait condition.
    pub criteria: String,
    /// Configured timeout, in seconds.
    pub timeout_s: i64,
    /// Final status; always one of the terminal variants.
    pub status: JobStatus,
    /// Final detail text (the wake body's detail clause).
    pub detail: String,
    /// When the terminal transition happened.
    pub resolved_at: DateTime<Utc>,
    /// Optional linked external task.
    pub task_id: Option<String>,
}

/// Durable record of jobs' creation and terminal outcome (§3, §6).
///
/// Used for crash-recovery listing only — the engine's authoritative live
/// state is the in-memory active set; the Store never drives scheduling.
#[async_trait]
pub trait Store: Send + Sync {
    /// Record that a job was just registered and is now active.
    async fn insert_active(&self, record: ActiveRecord) -> Result<(), StoreError>;

    /// Commit a job's terminal outcome and drop its active-record entry.
    async fn commit_terminal(&self, record: TerminalRecord) -> Result<(), StoreError>;

    /// Return every record left over in the active table from a previous
    /// run — jobs that were `watching` when the process last exited
    /// uncleanly. Called once at startup, before any `register` call.
    async fn take_orphaned(&self) -> Result<Vec<ActiveRecord>, StoreError>;
}

/// Default [`Store`] implementation: an active-records JSON file plus an
/// append-only terminal-records JSONL log, both under a configured
/// directory, written with the atomic tmp-file-then-rename pattern.
pub struct JsonFileStore {
    active_path: PathBuf,
    terminal_path: PathBuf,
    active: tokio::sync::Mutex<BTreeMap<JobId, ActiveRecord>>,
}

impl JsonFileStore {
    /// Open (or create) a store rooted at `dir`, loading any existing
    /// active-records file into memory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let active_path = dir.join("active.json");
        let terminal_path = dir.join("terminal.jsonl");

        let active = load_active(&active_path).await?;

        Ok(Self {
            active_path,
            terminal_path,
            active: tokio::sync::Mutex::new(active),
        })
    }

    async fn persist_active(&self, table: &BTreeMap<JobId, ActiveRecord>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(table)?;
        let path = self.active_path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

async fn load_active(path: &Path) -> Result<BTreeMap<JobId, ActiveRecord>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[async_trait]
impl Store for JsonFileStore {
    async fn insert_active(&self, record: ActiveRecord) -> Result<(), StoreError> {
        let mut table = self.active.lock().await;
        table.insert(record.id, record);
        self.persist_active(&table).await
    }

    async fn commit_terminal(&self, record: TerminalRecord) -> Result<(), StoreError> {
        {
            let mut table = self.active.lock().await;
            table.remove(&record.id);
            self.persist_active(&table).await?;
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let path = self.terminal_path.clone();
        tokio::task::spawn_blocking(move || append(&path, &line))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn take_orphaned(&self) -> Result<Vec<ActiveRecord>, StoreError> {
        let mut table = self.active.lock().await;
        let orphaned: Vec<ActiveRecord> = table.values().cloned().collect();
        table.clear();
        self.persist_active(&table).await?;
        Ok(orphaned)
    }
}

fn append(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)
}
