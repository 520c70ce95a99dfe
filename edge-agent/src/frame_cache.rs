//! Time-bounded frame store for ingestion, §4.4 of the spec.
//!
//! Captured NV12 buffers are cached under their wire `frame_id` so that,
//! once a detection arrives asynchronously, the ingester can still retrieve
//! the original pixels to attach to the upload. Entries are swept out by a
//! periodic background task; `destroy()` must be called to cancel it, or
//! the task keeps the runtime alive past shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct CachedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub ts_utc_ns: u64,
}

struct Entry {
    frame: CachedFrame,
    inserted_at: Instant,
}

struct Inner {
    entries: Mutex<HashMap<u64, Entry>>,
    ttl: Duration,
}

/// A cloneable handle to a shared frame cache; cloning does not duplicate
/// storage or spawn a second sweep task.
#[derive(Clone)]
pub struct FrameCache {
    inner: Arc<Inner>,
    sweep_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FrameCache {
    /// Creates the cache and spawns its periodic sweep task. The sweep
    /// interval is half the TTL, bounded to at least 100 ms so a tiny
    /// configured TTL cannot busy-loop the sweep.
    pub fn new(ttl: Duration) -> Self {
        let inner = Arc::new(Inner {
            entries: Mutex::new(HashMap::new()),
            ttl,
        });
        let sweep_interval = (ttl / 2).max(Duration::from_millis(100));
        let sweep_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                sweep_inner.sweep_expired();
            }
        });
        Self {
            inner,
            sweep_handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    pub fn insert(&self, frame_id: u64, frame: CachedFrame) {
        let mut entries = self.inner.entries.lock().unwrap();
        entries.insert(
            frame_id,
            Entry {
                frame,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Returns the frame if present and not past its TTL. A caller that
    /// receives `None` should treat the frame as gone and skip ingestion.
    pub fn get(&self, frame_id: u64) -> Option<CachedFrame> {
        let mut entries = self.inner.entries.lock().unwrap();
        match entries.get(&frame_id) {
            Some(entry) if entry.inserted_at.elapsed() <= self.inner.ttl => {
                Some(entry.frame.clone())
            }
            Some(_) => {
                entries.remove(&frame_id);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels the sweep task. Idempotent; safe to call more than once.
    pub fn destroy(&self) {
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn sweep_expired(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: u8) -> CachedFrame {
        CachedFrame {
            data: vec![n; 4],
            width: 2,
            height: 2,
            ts_utc_ns: 0,
        }
    }

    #[tokio::test]
    async fn get_returns_none_for_missing_key() {
        let cache = FrameCache::new(Duration::from_millis(2000));
        assert!(cache.get(42).is_none());
        cache.destroy();
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let cache = FrameCache::new(Duration::from_millis(2000));
        cache.insert(1, sample(7));
        let got = cache.get(1).unwrap();
        assert_eq!(got.data, vec![7, 7, 7, 7]);
        cache.destroy();
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_absent() {
        let cache = FrameCache::new(Duration::from_millis(20));
        cache.insert(1, sample(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get(1).is_none());
        cache.destroy();
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let cache = FrameCache::new(Duration::from_millis(2000));
        cache.destroy();
        cache.destroy();
    }
}
