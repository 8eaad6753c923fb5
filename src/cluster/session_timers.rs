//! Session TTL timers run by the leader.
//!
//! Every session with a TTL gets a timer of `ttl * SESSION_TTL_MULTIPLIER`.
//! Renewing a session replaces its pending timer; when a timer fires the
//! session is destroyed through the consensus log, retrying with backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use super::error::{Error, Result};
use super::metrics;
use super::retry;
use super::traits::Consensus;
use super::types::Command;
use crate::constants::SESSION_TTL_MULTIPLIER;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct SessionTimers {
    consensus: Arc<dyn Consensus>,
    timers: Arc<DashMap<String, Timer>>,
    generation: AtomicU64,
}

impl SessionTimers {
    pub fn new(consensus: Arc<dyn Consensus>) -> Self {
        Self {
            consensus,
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Start a timer for every session in the store that has a TTL.
    pub fn initialize(&self) -> Result<()> {
        let (_, sessions) = self.consensus.state().sessions(None)?;
        for session in sessions {
            if let Some(ttl) = session.ttl {
                self.reset(&session.id, ttl);
            }
        }
        tracing::debug!(timers = self.count(), "Initialized session timers");
        Ok(())
    }

    /// Start or restart the timer of a session. Zero TTLs never expire.
    pub fn reset(&self, id: &str, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let wait = ttl * SESSION_TTL_MULTIPLIER;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let consensus = self.consensus.clone();
        let timers = self.timers.clone();
        let session = id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            timers.remove_if(&session, |_, t| t.generation == generation);
            metrics::set_session_timers(timers.len());
            invalidate_session(consensus.as_ref(), &session).await;
        });

        if let Some(old) = self.timers.insert(id.to_string(), Timer { generation, handle }) {
            old.handle.abort();
        }
        metrics::set_session_timers(self.timers.len());
    }

    /// Stop the timer of a session.
    pub fn clear(&self, id: &str) {
        if let Some((_, timer)) = self.timers.remove(id) {
            timer.handle.abort();
        }
        metrics::set_session_timers(self.timers.len());
    }

    /// Stop every timer.
    pub fn clear_all(&self) {
        let ids: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, timer)) = self.timers.remove(&id) {
                timer.handle.abort();
            }
        }
        metrics::set_session_timers(0);
    }

    pub fn count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().handle.abort();
        }
    }
}

async fn invalidate_session(consensus: &dyn Consensus, id: &str) {
    let result = retry::with_session_invalidate_policy(
        || consensus.apply(Command::SessionDestroy { id: id.to_string() }),
        |_: &Error| true,
    )
    .await;

    metrics::record_session_invalidation(result.is_ok());
    match result {
        Ok(_) => tracing::debug!(session = id, "Session TTL expired"),
        Err(e) => {
            retry::record_retry_exhausted("session_invalidate");
            tracing::error!(session = id, error = %e, "Failed to invalidate session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::MockConsensus;
    use crate::cluster::types::Session;

    #[tokio::test]
    async fn test_reset_replaces_timer() {
        let consensus = Arc::new(MockConsensus::new());
        let timers = SessionTimers::new(consensus.clone());

        timers.reset("s1", Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(25)).await;
        timers.reset("s1", Duration::from_millis(20));
        assert_eq!(timers.count(), 1);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(consensus.applied_sessions_destroyed().is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(consensus.applied_sessions_destroyed(), vec!["s1".to_string()]);
        assert_eq!(timers.count(), 0);
    }

    #[tokio::test]
    async fn test_clear_stops_timer() {
        let consensus = Arc::new(MockConsensus::new());
        let timers = SessionTimers::new(consensus.clone());

        timers.reset("s1", Duration::from_millis(10));
        timers.reset("s2", Duration::from_millis(10));
        timers.clear("s1");
        timers.clear_all();
        assert_eq!(timers.count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(consensus.applied_sessions_destroyed().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_from_store() {
        let consensus = Arc::new(MockConsensus::new());
        for (id, ttl) in [("a", Some(Duration::from_secs(30))), ("b", None)] {
            consensus.store().insert_session(Session {
                id: id.to_string(),
                node: "n1".to_string(),
                name: String::new(),
                ttl,
                create_index: 1,
            });
        }

        let timers = SessionTimers::new(consensus);
        timers.initialize().unwrap();
        assert_eq!(timers.count(), 1);
        timers.clear_all();
    }

    #[tokio::test]
    async fn test_zero_ttl_ignored() {
        let timers = SessionTimers::new(Arc::new(MockConsensus::new()));
        timers.reset("s1", Duration::ZERO);
        assert_eq!(timers.count(), 0);
    }
}
