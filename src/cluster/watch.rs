//! Watch handles returned by state store reads.
//!
//! Every table in the store publishes its latest modify index on a
//! `tokio::sync::watch` channel. A read subscribes to the tables it touched
//! and collects the receivers in a [`WatchSet`]; waiting on the set resolves
//! as soon as any of those tables is written after the read.

use futures::future::select_all;
use tokio::sync::watch;

/// A set of invalidation handles gathered while running a query.
#[derive(Debug, Default)]
pub struct WatchSet {
    receivers: Vec<watch::Receiver<u64>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle. Only changes published after it was created will fire.
    pub fn add(&mut self, rx: watch::Receiver<u64>) {
        self.receivers.push(rx);
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    /// Wait until any handle fires. A closed channel counts as fired since the
    /// table behind it is gone. An empty set never resolves.
    pub async fn wait(&mut self) {
        if self.receivers.is_empty() {
            std::future::pending::<()>().await;
            return;
        }
        let changes = self
            .receivers
            .iter_mut()
            .map(|rx| Box::pin(rx.changed()));
        let _ = select_all(changes).await;
    }
}

/// Add a handle to an optional watch set.
pub fn add_to(ws: Option<&mut WatchSet>, rx: impl FnOnce() -> watch::Receiver<u64>) {
    if let Some(ws) = ws {
        ws.add(rx());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_fires_on_change() {
        let (tx, rx) = watch::channel(1u64);
        let mut ws = WatchSet::new();
        ws.add(rx);

        let waiter = tokio::spawn(async move {
            ws.wait().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send_replace(2);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("watch should fire")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_ignores_changes_before_subscribe() {
        let (tx, _keep) = watch::channel(1u64);
        tx.send_replace(2);
        let mut ws = WatchSet::new();
        ws.add(tx.subscribe());

        let fired = tokio::time::timeout(Duration::from_millis(50), ws.wait()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_counts_as_fired() {
        let (tx, rx) = watch::channel(0u64);
        let mut ws = WatchSet::new();
        ws.add(rx);
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), ws.wait())
            .await
            .expect("closed channel should resolve");
    }

    #[tokio::test]
    async fn test_empty_set_never_resolves() {
        let mut ws = WatchSet::new();
        assert!(ws.is_empty());
        let fired = tokio::time::timeout(Duration::from_millis(20), ws.wait()).await;
        assert!(fired.is_err());
    }
}
