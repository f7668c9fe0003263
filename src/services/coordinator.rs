//! Single-flight coordination for stream generation.
//!
//! At most one transcoder invocation may be in flight per stream variant.
//! Requests that miss the cache acquire the variant's lock, re-check the
//! cache, and only then invoke the encoder; concurrent requests for the same
//! variant queue on the lock and find the artifacts cached once it frees.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

pub struct GenerationGate {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl GenerationGate {
    pub fn new() -> Self {
        GenerationGate {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().expect("variant lock map poisoned")
    }

    /// Acquire the per-variant lock. The map mutex is only held long enough
    /// to clone the entry; the await happens outside it.
    pub async fn acquire(&self, variant_key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks()
            .entry(variant_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop lock entries nobody holds or waits on. Cloning an entry requires
    /// the map mutex, so a strong count of one here means the lock is idle.
    pub fn gc(&self) -> usize {
        let mut locks = self.locks();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = before - locks.len();
        if removed > 0 {
            debug!(removed, remaining = locks.len(), "collected idle variant locks");
        }
        removed
    }
}

impl Default for GenerationGate {
    fn default() -> Self {
        Self::new()
    }
}
