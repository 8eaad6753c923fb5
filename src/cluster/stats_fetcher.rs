//! Concurrent raft stats collection for autopilot's health loop.
//!
//! One task per server, bounded by the caller's deadline. A server whose
//! previous request is still outstanding is skipped rather than queued, so a
//! slow server can never accumulate requests.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::membership::ServerDescriptor;
use super::metrics;
use super::traits::{RpcTransport, call_typed};
use super::types::ServerStats;

/// RPC method returning a server's raft stats.
pub const RAFT_STATS_METHOD: &str = "Status.RaftStats";

pub struct StatsFetcher {
    transport: Arc<dyn RpcTransport>,
    datacenter: String,
    inflight: Arc<DashSet<String>>,
}

impl StatsFetcher {
    pub fn new(transport: Arc<dyn RpcTransport>, datacenter: String) -> Self {
        Self {
            transport,
            datacenter,
            inflight: Arc::new(DashSet::new()),
        }
    }

    /// Number of requests still outstanding, including abandoned ones.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Fetch stats from every server, returning what arrived before `deadline`.
    /// Results are keyed by server id.
    pub async fn fetch(
        &self,
        servers: &[ServerDescriptor],
        deadline: Instant,
    ) -> HashMap<String, ServerStats> {
        let (tx, mut rx) = mpsc::channel(servers.len().max(1));
        let mut spawned = 0usize;

        for server in servers {
            if !self.inflight.insert(server.id.clone()) {
                tracing::warn!(server = %server.name, "Stats request still in flight, skipping");
                metrics::record_stats_fetch("skipped");
                continue;
            }

            let transport = self.transport.clone();
            let inflight = self.inflight.clone();
            let datacenter = self.datacenter.clone();
            let server = server.clone();
            let tx = tx.clone();
            spawned += 1;

            tokio::spawn(async move {
                let result: super::error::Result<ServerStats> = call_typed(
                    transport.as_ref(),
                    &datacenter,
                    server.addr,
                    RAFT_STATS_METHOD,
                    &(),
                )
                .await;

                match result {
                    Ok(stats) => {
                        let _ = tx.send((server.id.clone(), stats)).await;
                    }
                    Err(e) => {
                        metrics::record_stats_fetch("error");
                        tracing::warn!(server = %server.name, error = %e, "Failed to fetch server stats");
                    }
                }

                inflight.remove(&server.id);
            });
        }
        drop(tx);

        let mut stats = HashMap::with_capacity(spawned);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((id, s))) => {
                    metrics::record_stats_fetch("success");
                    stats.insert(id, s);
                }
                Ok(None) => break,
                Err(_) => {
                    let missing = spawned.saturating_sub(stats.len());
                    tracing::debug!(missing, "Stats fetch deadline reached");
                    metrics::record_stats_fetch("timeout");
                    break;
                }
            }
        }
        stats
    }
}
