use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes capture calls against the same `display` (§4.4).
///
/// Two jobs reading from the same display never issue overlapping
/// `Capture::capture` calls; jobs on distinct displays proceed fully in
/// parallel. Lock entries are created lazily and never removed — the set
/// of distinct displays over a process lifetime is expected to stay small.
#[derive(Debug, Default)]
pub struct CaptureArbiter {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CaptureArbiter {
    /// Build an arbiter with no displays locked yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `display`, waiting if another job currently
    /// holds it. The returned guard releases the lock on drop.
    pub async fn acquire(&self, display: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(display.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_display_serializes() {
        let arbiter = Arc::new(CaptureArbiter::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let arbiter = arbiter.clone();
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = arbiter.acquire(":1").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_displays_run_concurrently() {
        let arbiter = Arc::new(CaptureArbiter::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let arbiter = arbiter.clone();
            let display = format!(":{i}");
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = arbiter.acquire(&display).await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_concurrent.load(Ordering::SeqCst) > 1);
    }
}
