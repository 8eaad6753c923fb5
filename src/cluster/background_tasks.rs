//! Named background task orchestration.
//!
//! Each long-running duty of a server (leadership monitor, gossip event
//! dispatch, autopilot's promote/prune and health loops) runs as a named
//! task in a [`BackgroundTaskRegistry`]. Every task is raced against the
//! registry's shutdown signal; on shutdown the registry waits for all of
//! them together and aborts whatever is still running at the deadline.
//!
//! Autopilot creates a fresh registry each time leadership is established
//! and shuts it down on revocation, so a registry is never reused after
//! shutdown.
//!
//! # Example
//!
//! ```rust,no_run
//! use consulate::cluster::background_tasks::BackgroundTaskRegistry;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut registry = BackgroundTaskRegistry::new();
//!
//!     registry.spawn_periodic("server_health", Duration::from_secs(2), |_tick| async {
//!         // sample server stats
//!     });
//!
//!     registry.shutdown_all().await;
//! }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Grace period given to tasks by [`BackgroundTaskRegistry::shutdown_all`].
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// Task body returned, was stopped, or was aborted.
    Finished,
}

/// Registry of named background tasks with unified shutdown.
pub struct BackgroundTaskRegistry {
    tasks: BTreeMap<&'static str, JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: bool,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: BTreeMap::new(),
            shutdown_tx,
            stopped: false,
        }
    }

    /// Spawn a named task. A task already registered under the same name is
    /// aborted first. Spawns after shutdown are ignored.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.stopped {
            tracing::warn!(task = name, "Registry stopped, not spawning task");
            return;
        }

        if let Some(previous) = self.tasks.remove(name) {
            previous.abort();
            tracing::debug!(task = name, "Replaced running task");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => tracing::debug!(task = name, "Task returned"),
                _ = shutdown_rx.recv() => tracing::debug!(task = name, "Task stopped"),
            }
        });

        tracing::info!(task = name, "Spawned background task");
        self.tasks.insert(name, handle);
    }

    /// Spawn a task that runs `task` every `interval`, starting one interval
    /// from now. A slow run delays the following ticks instead of bursting.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, interval: Duration, mut task: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            let mut timer =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            for tick in 0u64.. {
                timer.tick().await;
                task(tick).await;
            }
        });
    }

    /// Status of every registered task, ordered by name.
    pub fn statuses(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks
            .iter()
            .map(|(name, handle)| {
                let status = if handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub async fn shutdown_all(&mut self) {
        self.shutdown_all_with_timeout(SHUTDOWN_GRACE).await;
    }

    /// Signal every task, wait up to `timeout` for all of them, then abort
    /// the stragglers.
    pub async fn shutdown_all_with_timeout(&mut self, timeout: Duration) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _ = self.shutdown_tx.send(());

        let tasks = std::mem::take(&mut self.tasks);
        let count = tasks.len();
        let aborts: Vec<_> = tasks
            .iter()
            .map(|(name, handle)| (*name, handle.abort_handle()))
            .collect();
        let waits = tasks
            .into_iter()
            .map(|(name, handle)| async move { (name, handle.await) });

        match tokio::time::timeout(timeout, join_all(waits)).await {
            Ok(results) => {
                for (name, result) in results {
                    if let Err(e) = result
                        && e.is_panic()
                    {
                        tracing::warn!(task = name, error = %e, "Task panicked");
                    }
                }
            }
            Err(_) => {
                for (name, abort) in aborts {
                    if !abort.is_finished() {
                        tracing::warn!(task = name, "Task ignored shutdown, aborting");
                        abort.abort();
                    }
                }
            }
        }

        tracing::info!(task_count = count, "Background tasks stopped");
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.shutdown_tx.send(());
            for handle in self.tasks.values() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_statuses_report_running_tasks() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("leadership_monitor", std::future::pending());
        registry.spawn("lan_event_dispatch", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            registry.statuses(),
            vec![
                ("lan_event_dispatch", TaskStatus::Finished),
                ("leadership_monitor", TaskStatus::Running),
            ]
        );

        registry.shutdown_all().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_looping_task() {
        let mut registry = BackgroundTaskRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        registry.spawn("event_dispatch", async move {
            loop {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.shutdown_all_with_timeout(Duration::from_secs(1)).await;
        let after_shutdown = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_shutdown);
        assert!(registry.is_stopped());
    }

    #[tokio::test]
    async fn test_spawn_ignored_after_shutdown() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.shutdown_all().await;
        registry.spawn("late", async {});
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_same_name_replaces_task() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("autopilot", std::future::pending());
        registry.spawn("autopilot", std::future::pending());
        assert_eq!(registry.len(), 1);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_spawn_periodic_ticks() {
        let mut registry = BackgroundTaskRegistry::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let t = ticks.clone();

        registry.spawn_periodic("server_health", Duration::from_millis(10), move |_| {
            let t = t.clone();
            async move {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.shutdown_all().await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }
}
