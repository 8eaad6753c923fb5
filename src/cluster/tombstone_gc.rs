//! Tombstone garbage collection timers.
//!
//! Deleting an entry leaves a tombstone so blocking queries can observe the
//! delete. The leader hints the GC with the index of each delete; hints are
//! batched into buckets of `granularity` width that expire `ttl` after the
//! hint. When a bucket expires its highest index is sent on the expiry
//! channel and the leader reaps every tombstone up to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::{Error, Result};

struct Bucket {
    max_index: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct GcState {
    enabled: bool,
    /// Keyed by expiry time in nanoseconds since the epoch.
    buckets: HashMap<u128, Bucket>,
}

pub struct TombstoneGc {
    ttl: Duration,
    granularity: Duration,
    state: Arc<Mutex<GcState>>,
    expire_tx: mpsc::Sender<u64>,
    expire_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<u64>>>,
}

impl TombstoneGc {
    pub fn new(ttl: Duration, granularity: Duration) -> Result<Self> {
        if ttl.is_zero() || granularity.is_zero() {
            return Err(Error::Config(
                "tombstone TTL and granularity must be positive".to_string(),
            ));
        }

        let (expire_tx, expire_rx) = mpsc::channel(1);
        Ok(Self {
            ttl,
            granularity,
            state: Arc::new(Mutex::new(GcState::default())),
            expire_tx,
            expire_rx: Arc::new(tokio::sync::Mutex::new(expire_rx)),
        })
    }

    /// Receiver of expired indexes, consumed by the leader loop.
    pub fn expire_receiver(&self) -> Arc<tokio::sync::Mutex<mpsc::Receiver<u64>>> {
        self.expire_rx.clone()
    }

    /// Enable or disable the GC. Disabling drops every pending bucket.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !enabled {
            for (_, bucket) in state.buckets.drain() {
                bucket.handle.abort();
            }
        }
        state.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).enabled
    }

    /// Record that a tombstone was created at `index`.
    pub fn hint(&self, index: u64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let granularity = self.granularity.as_nanos();
        let expires = now + self.ttl.as_nanos();
        let bucket = expires + granularity - expires % granularity;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.enabled {
            return;
        }
        if let Some(existing) = state.buckets.get_mut(&bucket) {
            existing.max_index = existing.max_index.max(index);
            return;
        }

        let wait = Duration::from_nanos(u64::try_from(bucket - now).unwrap_or(u64::MAX));
        let shared = self.state.clone();
        let tx = self.expire_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let max_index = {
                let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
                state.buckets.remove(&bucket).map(|b| b.max_index)
            };
            if let Some(index) = max_index {
                let _ = tx.send(index).await;
            }
        });
        state.buckets.insert(
            bucket,
            Bucket {
                max_index: index,
                handle,
            },
        );
    }

    /// Whether any bucket is waiting to expire.
    pub fn pending_expiration(&self) -> bool {
        !self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .buckets
            .is_empty()
    }
}

impl Drop for TombstoneGc {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for (_, bucket) in state.buckets.drain() {
            bucket.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_durations() {
        assert!(TombstoneGc::new(Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(TombstoneGc::new(Duration::from_secs(1), Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_disabled_ignores_hints() {
        let gc = TombstoneGc::new(Duration::from_millis(20), Duration::from_millis(10)).unwrap();
        gc.hint(5);
        assert!(!gc.pending_expiration());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hints_batch_into_bucket() {
        // An hour-wide bucket holds every hint; paused time skips the wait.
        let gc = TombstoneGc::new(Duration::from_millis(20), Duration::from_secs(3600)).unwrap();
        gc.set_enabled(true);
        gc.hint(5);
        gc.hint(9);
        gc.hint(7);
        assert!(gc.pending_expiration());

        let rx = gc.expire_receiver();
        let mut rx = rx.lock().await;
        let index = tokio::time::timeout(Duration::from_secs(7200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index, 9);
        assert!(!gc.pending_expiration());
        assert!(
            tokio::time::timeout(Duration::from_secs(7200), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_disable_clears_buckets() {
        let gc = TombstoneGc::new(Duration::from_millis(10), Duration::from_millis(10)).unwrap();
        gc.set_enabled(true);
        gc.hint(1);
        gc.set_enabled(false);
        assert!(!gc.pending_expiration());
        assert!(!gc.is_enabled());

        let rx = gc.expire_receiver();
        let mut rx = rx.lock().await;
        assert!(
            tokio::time::timeout(Duration::from_millis(60), rx.recv())
                .await
                .is_err()
        );
    }
}
