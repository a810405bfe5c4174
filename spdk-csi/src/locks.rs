//! Per-key exclusive locks for volume names and IDs.
//!
//! Each service owns its own `VolumeLocks`; there is no process-wide
//! registry. Entries are dropped once nobody holds or waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct VolumeLocks {
    entries: Arc<Mutex<LockMap>>,
}

/// Held lock on one key; released on drop.
pub struct VolumeGuard {
    key: String,
    entries: Arc<Mutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until `key` is free and take it.
    pub async fn lock(&self, key: &str) -> VolumeGuard {
        let mutex = self.entry(key);
        let guard = mutex.lock_owned().await;
        VolumeGuard {
            key: key.to_string(),
            entries: self.entries.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn release_if_idle(entries: &Mutex<LockMap>, key: &str) {
    let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
    // Only the map itself still references the mutex
    if entries.get(key).is_some_and(|m| Arc::strong_count(m) == 1) {
        entries.remove(key);
    }
}

impl Drop for VolumeGuard {
    fn drop(&mut self) {
        // The owned guard keeps its own Arc; drop it before counting.
        self.guard.take();
        release_if_idle(&self.entries, &self.key);
    }
}
