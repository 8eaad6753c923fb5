//! Interfaces to the external collaborators of the coordination core.
//!
//! The core orchestrates but does not implement consensus, gossip, storage
//! or RPC marshaling. Each is consumed through one of these traits:
//!
//! - [`Consensus`]: the replicated log, its membership configuration and the
//!   leadership-change notification stream
//! - [`Gossip`]: LAN or WAN membership and user events
//! - [`StateStore`]: versioned reads with watch handles
//! - [`RpcTransport`]: typed calls keyed by datacenter, address and method
//!
//! In-memory implementations for tests live in `mock` behind the
//! `test-utilities` feature.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use super::error::Result;
use super::membership::Member;
use super::types::{
    AclToken, ApplyResponse, AutopilotConfig, Command, HealthCheck, HealthStatus, Node,
    NodeService, RaftServer, Session,
};
use super::watch::WatchSet;

/// The replicated consensus log.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Current state store. Replaced wholesale when a snapshot is restored.
    fn state(&self) -> Arc<dyn StateStore>;

    fn is_leader(&self) -> bool;

    /// Address of the current leader, if one is known.
    fn leader(&self) -> Option<String>;

    /// Time since this node last heard from the leader.
    fn last_contact(&self) -> Duration;

    /// Index of the last log entry.
    fn last_index(&self) -> u64;

    /// Term of the last log entry.
    fn last_log_term(&self) -> u64;

    /// Leadership-change notifications. `true` when this node becomes leader.
    fn leadership_watch(&self) -> watch::Receiver<bool>;

    /// Block until every previously committed entry is applied locally.
    async fn barrier(&self, timeout: Duration) -> Result<()>;

    /// Confirm with a quorum that this node is still leader.
    async fn verify_leader(&self) -> Result<()>;

    async fn apply(&self, command: Command) -> Result<ApplyResponse>;

    async fn configuration(&self) -> Result<Vec<RaftServer>>;

    async fn add_voter(&self, id: &str, address: &str) -> Result<()>;

    async fn add_nonvoter(&self, id: &str, address: &str) -> Result<()>;

    /// Legacy address-based add. The server's id becomes its address.
    async fn add_peer(&self, address: &str) -> Result<()>;

    async fn remove_server(&self, id: &str) -> Result<()>;

    /// Legacy address-based removal.
    async fn remove_peer(&self, address: &str) -> Result<()>;
}

/// A gossip pool (LAN or WAN).
#[async_trait]
pub trait Gossip: Send + Sync {
    fn members(&self) -> Vec<Member>;

    fn local_member(&self) -> Member;

    async fn user_event(&self, name: &str, payload: Vec<u8>, coalesce: bool) -> Result<()>;

    /// Force a failed member into the left state.
    async fn remove_failed_node(&self, name: &str) -> Result<()>;

    async fn join(&self, addrs: &[String]) -> Result<usize>;
}

/// Versioned state store. Every read returns the index of the tables it
/// touched and, when given a watch set, registers their invalidation handles.
pub trait StateStore: Send + Sync {
    fn get_node(&self, ws: Option<&mut WatchSet>, node: &str) -> Result<(u64, Option<Node>)>;

    fn nodes(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Vec<Node>)>;

    fn node_services(
        &self,
        ws: Option<&mut WatchSet>,
        node: &str,
    ) -> Result<(u64, Vec<NodeService>)>;

    fn node_checks(&self, ws: Option<&mut WatchSet>, node: &str)
    -> Result<(u64, Vec<HealthCheck>)>;

    /// Checks in the given state, or all checks when `state` is `None`.
    fn checks_in_state(
        &self,
        ws: Option<&mut WatchSet>,
        state: Option<HealthStatus>,
    ) -> Result<(u64, Vec<HealthCheck>)>;

    fn sessions(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Vec<Session>)>;

    fn session_get(&self, ws: Option<&mut WatchSet>, id: &str) -> Result<(u64, Option<Session>)>;

    fn acl_get(&self, ws: Option<&mut WatchSet>, id: &str) -> Result<(u64, Option<AclToken>)>;

    fn acl_list(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Vec<AclToken>)>;

    fn autopilot_config(&self) -> Result<(u64, Option<AutopilotConfig>)>;

    /// Fires when this store is abandoned, e.g. replaced by a snapshot restore.
    fn abandon_handle(&self) -> watch::Receiver<u64>;
}

/// RPC transport to other servers.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(
        &self,
        datacenter: &str,
        addr: SocketAddr,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// Typed wrapper over [`RpcTransport::call`].
pub async fn call_typed<A, R>(
    transport: &dyn RpcTransport,
    datacenter: &str,
    addr: SocketAddr,
    method: &str,
    args: &A,
) -> Result<R>
where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let args = serde_json::to_value(args)?;
    let reply = transport.call(datacenter, addr, method, args).await?;
    Ok(serde_json::from_value(reply)?)
}
