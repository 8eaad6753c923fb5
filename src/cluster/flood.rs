//! Flood notifications.
//!
//! Subscribers (such as the WAN join flooder) are poked whenever a server of
//! the local datacenter joins. Each subscriber holds at most one pending
//! signal; a full channel means one is already queued.

use std::sync::RwLock;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::metrics;

#[derive(Debug, Default)]
pub struct FloodNotifier {
    subscribers: RwLock<Vec<mpsc::Sender<()>>>,
}

impl FloodNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Signal every subscriber without blocking. Dropped subscribers are pruned.
    pub fn notify(&self) {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Closed(_))));
        metrics::FLOOD_NOTIFICATIONS.inc();
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_coalesces() {
        let flood = FloodNotifier::new();
        let mut rx = flood.subscribe();

        flood.notify();
        flood.notify();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_subscribers_pruned() {
        let flood = FloodNotifier::new();
        let rx = flood.subscribe();
        let _keep = flood.subscribe();
        assert_eq!(flood.len(), 2);

        drop(rx);
        flood.notify();
        assert_eq!(flood.len(), 1);
    }
}
