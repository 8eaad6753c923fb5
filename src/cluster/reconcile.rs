//! Catalog reconciliation of LAN gossip membership.
//!
//! The leader keeps the catalog in line with gossip: alive members are
//! registered with a passing serf check, failed members get a critical one,
//! and members that left or were reaped are deregistered. Servers are also
//! joined to or removed from the consensus configuration.
//!
//! Every handler reads the current catalog first and skips the write when
//! nothing would change, so a second pass over the same membership applies
//! nothing.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use super::config::ServerConfig;
use super::error::{Error, Result};
use super::membership::{
    MemberRole, MemberStatus, ParsedMember, ServerDescriptor, ServerDirectory, min_raft_protocol,
    parse_members,
};
use super::metrics;
use super::traits::{Consensus, Gossip};
use super::types::{
    Command, DeregisterRequest, HealthCheck, HealthStatus, NodeService, RegisterRequest,
};
use crate::constants::{
    SERF_CHECK_ALIVE_OUTPUT, SERF_CHECK_FAILED_OUTPUT, SERF_CHECK_ID, SERF_CHECK_NAME,
    SERVER_SERVICE_ID, SERVER_SERVICE_NAME,
};

/// Status a member is reconciled under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStatus {
    Alive,
    Failed,
    Left,
    /// Removed from gossip entirely.
    Reaped,
}

impl ReconcileStatus {
    /// Gossip statuses that need no reconciliation map to `None`.
    pub fn from_member(status: MemberStatus) -> Option<Self> {
        match status {
            MemberStatus::Alive => Some(ReconcileStatus::Alive),
            MemberStatus::Failed => Some(ReconcileStatus::Failed),
            MemberStatus::Left => Some(ReconcileStatus::Left),
            MemberStatus::Leaving | MemberStatus::None => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileStatus::Alive => "alive",
            ReconcileStatus::Failed => "failed",
            ReconcileStatus::Left => "left",
            ReconcileStatus::Reaped => "reaped",
        }
    }
}

/// A member queued for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileEvent {
    pub member: ParsedMember,
    pub status: ReconcileStatus,
}

impl ReconcileEvent {
    pub fn new(member: ParsedMember, status: ReconcileStatus) -> Self {
        Self { member, status }
    }

    /// Event for a member under its current gossip status.
    pub fn from_member(member: ParsedMember) -> Option<Self> {
        ReconcileStatus::from_member(member.status).map(|status| Self { member, status })
    }
}

pub struct Reconciler {
    config: Arc<ServerConfig>,
    consensus: Arc<dyn Consensus>,
    lan: Arc<dyn Gossip>,
    servers: Arc<ServerDirectory>,
    remove_dead: Option<mpsc::Sender<()>>,
}

impl Reconciler {
    pub fn new(
        config: Arc<ServerConfig>,
        consensus: Arc<dyn Consensus>,
        lan: Arc<dyn Gossip>,
        servers: Arc<ServerDirectory>,
    ) -> Self {
        Self {
            config,
            consensus,
            lan,
            servers,
            remove_dead: None,
        }
    }

    /// Signal autopilot to recheck dead servers after a server is added.
    pub fn with_remove_dead_signal(mut self, tx: mpsc::Sender<()>) -> Self {
        self.remove_dead = Some(tx);
        self
    }

    /// Reconcile every gossip member, then reap catalog nodes gossip no
    /// longer knows about.
    pub async fn reconcile(&self) -> Result<()> {
        let started = Instant::now();
        let members = parse_members(&self.lan.members());

        let mut known = HashSet::with_capacity(members.len());
        for member in &members {
            known.insert(member.name.clone());
            if let Some(event) = ReconcileEvent::from_member(member.clone()) {
                self.reconcile_member(&event).await?;
            }
        }

        self.reconcile_reaped(&known).await?;
        metrics::record_leader_operation("reconcile", started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Reconcile one member.
    ///
    /// Permission denied is logged and swallowed; other errors propagate.
    pub async fn reconcile_member(&self, event: &ReconcileEvent) -> Result<()> {
        let member = &event.member;
        if member.datacenter != self.config.datacenter {
            tracing::warn!(member = %member.name, datacenter = %member.datacenter, "Skipping reconcile of node from another datacenter");
            return Ok(());
        }

        let result = match event.status {
            ReconcileStatus::Alive => self.handle_alive(member).await,
            ReconcileStatus::Failed => self.handle_failed(member).await,
            ReconcileStatus::Left | ReconcileStatus::Reaped => {
                self.handle_deregister(member, event.status).await
            }
        };

        let status = event.status.as_str();
        match result {
            Ok(()) => {
                metrics::record_reconcile_member(status, "ok");
                Ok(())
            }
            Err(e) if e.is_permission_denied() => {
                metrics::record_reconcile_member(status, "denied");
                tracing::error!(member = %member.name, status, error = %e, "Failed to reconcile member");
                Ok(())
            }
            Err(e) => {
                metrics::record_reconcile_member(status, "error");
                tracing::error!(member = %member.name, status, error = %e, "Failed to reconcile member");
                Err(e)
            }
        }
    }

    /// Reap catalog nodes with a serf check that gossip does not know.
    async fn reconcile_reaped(&self, known: &HashSet<String>) -> Result<()> {
        let state = self.consensus.state();
        let (_, checks) = state.checks_in_state(None, None)?;

        for check in checks {
            if check.check_id != SERF_CHECK_ID || known.contains(&check.node) {
                continue;
            }

            let (_, services) = state.node_services(None, &check.node)?;
            let mut role = MemberRole::Client;
            let mut addr = IpAddr::from([0, 0, 0, 0]);

            if let Some(service) = services.iter().find(|s| s.id == SERVER_SERVICE_ID) {
                let (_, node) = state.get_node(None, &check.node)?;
                if let Some(ip) = node.and_then(|n| n.address.parse::<IpAddr>().ok()) {
                    addr = ip;
                    let server_addr = SocketAddr::new(ip, service.port);
                    let id = self
                        .servers
                        .server(&server_addr)
                        .map(|s| s.id)
                        .unwrap_or_default();
                    role = MemberRole::Server(ServerDescriptor {
                        name: check.node.clone(),
                        id,
                        datacenter: self.config.datacenter.clone(),
                        addr: server_addr,
                        bootstrap: false,
                        expect: 0,
                        build: String::new(),
                        raft_version: 1,
                        status: MemberStatus::None,
                    });
                }
            }

            let member = ParsedMember {
                name: check.node.clone(),
                addr,
                node_id: String::new(),
                datacenter: self.config.datacenter.clone(),
                status: MemberStatus::None,
                role,
            };
            self.reconcile_member(&ReconcileEvent::new(member, ReconcileStatus::Reaped))
                .await?;
        }
        Ok(())
    }

    async fn handle_alive(&self, member: &ParsedMember) -> Result<()> {
        let service = match member.server() {
            Some(server) => {
                self.join_server(member, server).await?;
                Some(NodeService {
                    id: SERVER_SERVICE_ID.to_string(),
                    service: SERVER_SERVICE_NAME.to_string(),
                    port: server.addr.port(),
                    ..NodeService::default()
                })
            }
            None => None,
        };

        if self.catalog_matches(member, service.as_ref())? {
            tracing::trace!(member = %member.name, "Member already registered");
            return Ok(());
        }

        tracing::info!(member = %member.name, "Member joined, marking health alive");
        self.apply(Command::Register(RegisterRequest {
            datacenter: self.config.datacenter.clone(),
            node: member.name.clone(),
            id: member.node_id.clone(),
            address: member.addr.to_string(),
            service,
            check: Some(self.serf_check(member, HealthStatus::Passing, SERF_CHECK_ALIVE_OUTPUT)),
            skip_node_update: true,
        }))
        .await
    }

    /// Whether the catalog already has the node at this address, the server
    /// service when expected, and a passing serf check.
    fn catalog_matches(&self, member: &ParsedMember, service: Option<&NodeService>) -> Result<bool> {
        let state = self.consensus.state();
        let (_, node) = state.get_node(None, &member.name)?;
        if !node.is_some_and(|n| n.address == member.addr.to_string()) {
            return Ok(false);
        }

        if let Some(expected) = service {
            let (_, services) = state.node_services(None, &member.name)?;
            if !services
                .iter()
                .any(|s| s.id == expected.id && s.port == expected.port)
            {
                return Ok(false);
            }
        }

        let (_, checks) = state.node_checks(None, &member.name)?;
        Ok(checks
            .iter()
            .any(|c| c.check_id == SERF_CHECK_ID && c.status == HealthStatus::Passing))
    }

    async fn handle_failed(&self, member: &ParsedMember) -> Result<()> {
        let state = self.consensus.state();
        let (_, node) = state.get_node(None, &member.name)?;
        if node.is_some_and(|n| n.address == member.addr.to_string()) {
            let (_, checks) = state.node_checks(None, &member.name)?;
            if checks
                .iter()
                .any(|c| c.check_id == SERF_CHECK_ID && c.status == HealthStatus::Critical)
            {
                return Ok(());
            }
        }

        tracing::info!(member = %member.name, "Member failed, marking health critical");
        self.apply(Command::Register(RegisterRequest {
            datacenter: self.config.datacenter.clone(),
            node: member.name.clone(),
            id: member.node_id.clone(),
            address: member.addr.to_string(),
            service: None,
            check: Some(self.serf_check(member, HealthStatus::Critical, SERF_CHECK_FAILED_OUTPUT)),
            skip_node_update: true,
        }))
        .await
    }

    async fn handle_deregister(&self, member: &ParsedMember, status: ReconcileStatus) -> Result<()> {
        if member.name == self.config.node_name {
            tracing::warn!(member = %member.name, "Deregistering self should be done by follower");
            return Ok(());
        }

        if let Some(server) = member.server() {
            self.remove_server(server).await?;
        }

        let (_, node) = self.consensus.state().get_node(None, &member.name)?;
        if node.is_none() {
            return Ok(());
        }

        tracing::info!(member = %member.name, reason = status.as_str(), "Deregistering member");
        self.apply(Command::Deregister(DeregisterRequest {
            datacenter: self.config.datacenter.clone(),
            node: member.name.clone(),
        }))
        .await
    }

    /// Add a server to the consensus configuration.
    async fn join_server(&self, member: &ParsedMember, server: &ServerDescriptor) -> Result<()> {
        if member.name == self.config.node_name {
            return Ok(());
        }

        let members = parse_members(&self.lan.members());
        if server.bootstrap
            && let Some(other) = members
                .iter()
                .filter(|m| m.name != member.name)
                .filter_map(ParsedMember::server)
                .find(|s| s.bootstrap)
        {
            tracing::error!(
                server = %member.name,
                other = %other.name,
                "Both servers are in bootstrap mode, only one node should be, not adding consensus peer"
            );
            return Ok(());
        }

        let addr = server.addr.to_string();
        let min_raft = min_raft_protocol(&members, &self.config.datacenter)?;
        let configuration = self.consensus.configuration().await?;

        for existing in &configuration {
            let same_addr = existing.address == addr;
            let same_id = !server.id.is_empty() && existing.id == server.id;

            if same_addr && (min_raft < 2 || server.raft_version < 3) {
                return Ok(());
            }
            if same_addr || same_id {
                if same_addr && same_id {
                    return Ok(());
                }
                self.consensus.remove_server(&existing.id).await.map_err(|e| {
                    let what = if same_addr { "address" } else { "ID" };
                    Error::Consensus(format!(
                        "error removing server with duplicate {what} {}: {e}",
                        if same_addr { &existing.address } else { &existing.id }
                    ))
                })?;
                tracing::info!(id = %existing.id, address = %existing.address, "Removed server with duplicate address or ID");
            }
        }

        let result = match min_raft {
            v if v >= 3 => self.consensus.add_nonvoter(&server.id, &addr).await,
            2 if server.raft_version >= 3 => self.consensus.add_voter(&server.id, &addr).await,
            _ => self.consensus.add_peer(&addr).await,
        };
        if let Err(e) = result {
            tracing::error!(server = %server, error = %e, "Failed to add consensus peer");
            return Err(e);
        }
        tracing::info!(server = %server, "Added consensus peer");

        if let Some(tx) = &self.remove_dead {
            let _ = tx.try_send(());
        }
        Ok(())
    }

    /// Remove a server from the consensus configuration, by id when every
    /// server understands id-based removal, else by address.
    async fn remove_server(&self, server: &ServerDescriptor) -> Result<()> {
        let addr = server.addr.to_string();
        let members = parse_members(&self.lan.members());
        let min_raft = min_raft_protocol(&members, &self.config.datacenter)?;
        let configuration = self.consensus.configuration().await?;

        for existing in &configuration {
            if min_raft >= 2 && !server.id.is_empty() && existing.id == server.id {
                tracing::info!(id = %existing.id, "Removing server by ID");
                self.consensus.remove_server(&existing.id).await?;
                break;
            } else if existing.address == addr {
                tracing::info!(address = %addr, "Removing server by address");
                self.consensus.remove_peer(&addr).await?;
                break;
            }
        }
        Ok(())
    }

    fn serf_check(&self, member: &ParsedMember, status: HealthStatus, output: &str) -> HealthCheck {
        HealthCheck {
            node: member.name.clone(),
            check_id: SERF_CHECK_ID.to_string(),
            name: SERF_CHECK_NAME.to_string(),
            status,
            output: output.to_string(),
            service_id: String::new(),
            service_name: String::new(),
            modify_index: 0,
        }
    }

    async fn apply(&self, command: Command) -> Result<()> {
        let kind = command.kind();
        let result = self.consensus.apply(command).await;
        metrics::record_catalog_write(kind, result.is_ok());
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ReconcileStatus::from_member(MemberStatus::Alive),
            Some(ReconcileStatus::Alive)
        );
        assert_eq!(
            ReconcileStatus::from_member(MemberStatus::Left),
            Some(ReconcileStatus::Left)
        );
        assert_eq!(ReconcileStatus::from_member(MemberStatus::Leaving), None);
        assert_eq!(ReconcileStatus::from_member(MemberStatus::None), None);
        assert_eq!(ReconcileStatus::Reaped.as_str(), "reaped");
    }
}
