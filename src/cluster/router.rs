//! Request routing.
//!
//! Every request entering a server passes through [`Forwarder::forward`],
//! which decides whether it runs locally or is sent elsewhere:
//!
//! 1. Requests for another datacenter go to a server picked from the WAN
//!    [`RouteTable`]. A server that fails a call is rotated to the back.
//! 2. Reads that tolerate staleness run locally.
//! 3. The leader runs everything else locally.
//! 4. Followers forward to the known leader.
//! 5. With no leader known the request is held, polling with jittered
//!    backoff, until one appears or `rpc_hold_timeout` expires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use dashmap::DashMap;
use tokio::time::Instant;

use super::acl::resolver::{PolicyReply, PolicyRequest, PolicySource};
use super::config::ServerConfig;
use super::error::{Error, Result};
use super::membership::{MemberStatus, ServerDescriptor, ServerDirectory};
use super::metrics;
use super::retry;
use super::traits::{Consensus, RpcTransport};

/// RPC method serving ACL policies from the ACL datacenter.
pub const GET_POLICY_METHOD: &str = "ACL.GetPolicy";

/// Routing facts about a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// Target datacenter. Empty means local.
    pub datacenter: String,
    pub allow_stale: bool,
    pub is_read: bool,
}

impl RequestInfo {
    pub fn read(datacenter: &str, allow_stale: bool) -> Self {
        Self {
            datacenter: datacenter.to_string(),
            allow_stale,
            is_read: true,
        }
    }

    pub fn write(datacenter: &str) -> Self {
        Self {
            datacenter: datacenter.to_string(),
            allow_stale: false,
            is_read: false,
        }
    }
}

/// Where a request was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutcome {
    /// The caller should handle the request itself.
    Local,
    /// The request was handled remotely; this is the reply.
    Remote(serde_json::Value),
}

/// Servers of every known remote datacenter, in preference order.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<String, Vec<ServerDescriptor>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a server.
    pub fn add_server(&self, server: ServerDescriptor) {
        let mut servers = self.routes.entry(server.datacenter.clone()).or_default();
        match servers.iter_mut().find(|s| s.name == server.name) {
            Some(existing) => *existing = server,
            None => servers.push(server),
        }
    }

    pub fn remove_server(&self, server: &ServerDescriptor) {
        if let Some(mut servers) = self.routes.get_mut(&server.datacenter) {
            servers.retain(|s| s.name != server.name);
        }
        self.routes
            .remove_if(&server.datacenter, |_, servers| servers.is_empty());
    }

    /// Move a server to the back of its datacenter's list.
    pub fn notify_failed(&self, datacenter: &str, addr: SocketAddr) {
        if let Some(mut servers) = self.routes.get_mut(datacenter)
            && let Some(pos) = servers.iter().position(|s| s.addr == addr)
        {
            let server = servers.remove(pos);
            servers.push(server);
        }
    }

    /// First server of the datacenter not known to be failed, else the first.
    pub fn find_route(&self, datacenter: &str) -> Option<ServerDescriptor> {
        let servers = self.routes.get(datacenter)?;
        servers
            .iter()
            .find(|s| s.status != MemberStatus::Failed)
            .or_else(|| servers.first())
            .cloned()
    }

    pub fn datacenters(&self) -> Vec<String> {
        let mut dcs: Vec<String> = self.routes.iter().map(|e| e.key().clone()).collect();
        dcs.sort();
        dcs
    }
}

/// Decides where requests run and forwards those that run elsewhere.
pub struct Forwarder {
    config: Arc<ServerConfig>,
    consensus: Arc<dyn Consensus>,
    transport: Arc<dyn RpcTransport>,
    routes: Arc<RouteTable>,
    servers: Arc<ServerDirectory>,
}

impl Forwarder {
    pub fn new(
        config: Arc<ServerConfig>,
        consensus: Arc<dyn Consensus>,
        transport: Arc<dyn RpcTransport>,
        routes: Arc<RouteTable>,
        servers: Arc<ServerDirectory>,
    ) -> Self {
        Self {
            config,
            consensus,
            transport,
            routes,
            servers,
        }
    }

    /// The leader, if consensus knows one and it is in the server directory.
    pub fn known_leader(&self) -> Option<ServerDescriptor> {
        let addr: SocketAddr = self.consensus.leader()?.parse().ok()?;
        self.servers.server(&addr)
    }

    pub async fn forward(
        &self,
        method: &str,
        info: &RequestInfo,
        args: &serde_json::Value,
    ) -> Result<ForwardOutcome> {
        if !info.datacenter.is_empty() && info.datacenter != self.config.datacenter {
            return self
                .forward_dc(method, &info.datacenter, args.clone())
                .await
                .map(ForwardOutcome::Remote);
        }

        if info.is_read && info.allow_stale {
            return Ok(ForwardOutcome::Local);
        }

        let started = Instant::now();
        let mut backoff = retry::leader_wait_policy().build();
        let mut attempt = 0u32;

        loop {
            if self.consensus.is_leader() {
                return Ok(ForwardOutcome::Local);
            }

            let mut last_err = Error::NoLeader;
            if let Some(leader) = self.known_leader() {
                match self
                    .transport
                    .call(&self.config.datacenter, leader.addr, method, args.clone())
                    .await
                {
                    Ok(reply) => {
                        metrics::record_rpc_forward("leader", "success");
                        return Ok(ForwardOutcome::Remote(reply));
                    }
                    Err(e) => {
                        let can_retry = e.is_no_leader() || (info.is_read && e.is_stream_error());
                        if !can_retry {
                            metrics::record_rpc_forward("leader", "error");
                            return Err(e);
                        }
                        tracing::debug!(method, leader = %leader.addr, error = %e, "Retrying forward to leader");
                        last_err = e;
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.rpc_hold_timeout {
                metrics::record_rpc_forward("leader", "no_leader");
                retry::record_retry_exhausted("leader_wait");
                return Err(last_err);
            }

            attempt += 1;
            retry::record_retry_attempt("leader_wait", attempt);
            let delay = backoff
                .next()
                .unwrap_or(Duration::from_secs(1))
                .min(self.config.rpc_hold_timeout - elapsed);
            tokio::time::sleep(delay).await;
        }
    }

    /// Send a request to a server of another datacenter.
    pub async fn forward_dc(
        &self,
        method: &str,
        datacenter: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let Some(server) = self.routes.find_route(datacenter) else {
            metrics::record_rpc_forward("datacenter", "no_path");
            tracing::warn!(datacenter, method, "No path to datacenter");
            return Err(Error::NoDcPath(datacenter.to_string()));
        };

        match self.transport.call(datacenter, server.addr, method, args).await {
            Ok(reply) => {
                metrics::record_rpc_forward("datacenter", "success");
                Ok(reply)
            }
            Err(e) => {
                metrics::record_rpc_forward("datacenter", "error");
                self.routes.notify_failed(datacenter, server.addr);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PolicySource for Forwarder {
    async fn get_policy(&self, request: &PolicyRequest) -> Result<PolicyReply> {
        let info = RequestInfo::read(&request.datacenter, false);
        let args = serde_json::to_value(request)?;
        match self.forward(GET_POLICY_METHOD, &info, &args).await? {
            ForwardOutcome::Remote(reply) => Ok(serde_json::from_value(reply)?),
            ForwardOutcome::Local => Err(Error::Consensus(
                "gained leadership during policy fetch".to_string(),
            )),
        }
    }
}
