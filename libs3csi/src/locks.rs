//! Per-volume serialization.
//!
//! The check-then-mount sequence of a lifecycle call is not atomic against
//! the mount table, so calls for the same volume id take turns.  Calls for
//! different volume ids never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::VolumeId;

type LockMap = DashMap<VolumeId, Arc<Mutex<()>>>;

/// Async mutexes keyed by [`VolumeId`], created on first use and dropped
/// once nobody holds or waits for them.
#[derive(Debug, Clone, Default)]
pub struct VolumeLocks {
    inner: Arc<LockMap>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `volume_id`.
    pub async fn lock(&self, volume_id: &VolumeId) -> VolumeGuard {
        let mutex = self.inner.entry(volume_id.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        VolumeGuard {
            guard: Some(guard),
            locks: Arc::clone(&self.inner),
            volume_id: volume_id.clone(),
        }
    }

    /// Number of volume ids currently locked or waited on.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Held for the duration of one lifecycle call.
pub struct VolumeGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
    volume_id: VolumeId,
}

impl Drop for VolumeGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: no holder, no waiter.
        self.locks
            .remove_if(&self.volume_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
