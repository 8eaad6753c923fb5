//! Gossip event dispatch.
//!
//! LAN events keep the server directory current, kick flood subscribers when
//! a local server joins, and, on the leader, queue members for
//! reconciliation. WAN events keep the cross-datacenter route table current.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use super::config::ServerConfig;
use super::flood::FloodNotifier;
use super::membership::{Member, ParsedMember, ServerDirectory};
use super::reconcile::{ReconcileEvent, ReconcileStatus};
use super::router::RouteTable;
use super::traits::Consensus;
use crate::constants::NEW_LEADER_EVENT;

/// An event delivered by a gossip pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipEvent {
    MemberJoin(Vec<Member>),
    MemberUpdate(Vec<Member>),
    MemberLeave(Vec<Member>),
    MemberFailed(Vec<Member>),
    /// Members removed from gossip entirely.
    MemberReap(Vec<Member>),
    User { name: String, payload: Vec<u8> },
}

pub struct EventDispatcher {
    config: Arc<ServerConfig>,
    consensus: Arc<dyn Consensus>,
    servers: Arc<ServerDirectory>,
    routes: Arc<RouteTable>,
    flood: Arc<FloodNotifier>,
    reconcile_tx: mpsc::Sender<ReconcileEvent>,
}

impl EventDispatcher {
    pub fn new(
        config: Arc<ServerConfig>,
        consensus: Arc<dyn Consensus>,
        servers: Arc<ServerDirectory>,
        routes: Arc<RouteTable>,
        flood: Arc<FloodNotifier>,
        reconcile_tx: mpsc::Sender<ReconcileEvent>,
    ) -> Self {
        Self {
            config,
            consensus,
            servers,
            routes,
            flood,
            reconcile_tx,
        }
    }

    pub fn handle_lan_event(&self, event: &GossipEvent) {
        match event {
            GossipEvent::MemberJoin(members) | GossipEvent::MemberUpdate(members) => {
                self.lan_servers_joined(members);
                self.queue_reconcile(members, false);
            }
            GossipEvent::MemberLeave(members) | GossipEvent::MemberFailed(members) => {
                self.lan_servers_failed(members);
                self.queue_reconcile(members, false);
            }
            GossipEvent::MemberReap(members) => {
                self.lan_servers_failed(members);
                self.queue_reconcile(members, true);
            }
            GossipEvent::User { name, payload } => {
                if name == NEW_LEADER_EVENT {
                    tracing::info!(leader = %String::from_utf8_lossy(payload), "New leader elected");
                } else {
                    tracing::debug!(event = %name, "Unhandled local event");
                }
            }
        }
    }

    fn lan_servers_joined(&self, members: &[Member]) {
        let mut joined = false;
        for member in members {
            let parsed = ParsedMember::parse(member);
            let Some(server) = parsed.server() else { continue };
            if server.datacenter != self.config.datacenter {
                tracing::warn!(server = %server, "Member is a server from another datacenter");
                continue;
            }
            tracing::info!(server = %server, "Adding LAN server");
            self.servers.add_server(server.clone());
            joined = true;
        }
        if joined {
            self.flood.notify();
        }
    }

    fn lan_servers_failed(&self, members: &[Member]) {
        for member in members {
            let parsed = ParsedMember::parse(member);
            if let Some(server) = parsed.server()
                && server.datacenter == self.config.datacenter
            {
                tracing::info!(server = %server, "Removing LAN server");
                self.servers.remove_server(server);
            }
        }
    }

    /// Queue members for reconciliation, only while leading. A full queue
    /// drops the member; the next periodic reconcile picks it up.
    fn queue_reconcile(&self, members: &[Member], reaped: bool) {
        if !self.consensus.is_leader() {
            return;
        }
        for member in members {
            let parsed = ParsedMember::parse(member);
            let event = if reaped {
                Some(ReconcileEvent::new(parsed, ReconcileStatus::Reaped))
            } else {
                ReconcileEvent::from_member(parsed)
            };
            if let Some(event) = event
                && self.reconcile_tx.try_send(event).is_err()
            {
                tracing::debug!(member = %member.name, "Reconcile queue full, dropping member event");
            }
        }
    }

    pub fn handle_wan_event(&self, event: &GossipEvent) {
        match event {
            GossipEvent::MemberJoin(members)
            | GossipEvent::MemberUpdate(members)
            | GossipEvent::MemberFailed(members) => {
                for server in members.iter().map(ParsedMember::parse) {
                    if let Some(server) = server.server() {
                        tracing::info!(server = %server, status = %server.status, "Updating WAN route");
                        self.routes.add_server(server.clone());
                    }
                }
            }
            GossipEvent::MemberLeave(members) | GossipEvent::MemberReap(members) => {
                for server in members.iter().map(ParsedMember::parse) {
                    if let Some(server) = server.server() {
                        tracing::info!(server = %server, "Removing WAN route");
                        self.routes.remove_server(server);
                    }
                }
            }
            GossipEvent::User { .. } => {}
        }
    }

    /// Dispatch LAN events until the channel closes or shutdown is signalled.
    pub async fn run_lan(
        self: Arc<Self>,
        mut events: mpsc::Receiver<GossipEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_lan_event(&event),
                _ = shutdown.recv() => break,
                else => break,
            }
        }
        tracing::debug!("LAN event dispatch stopped");
    }

    /// Dispatch WAN events until the channel closes or shutdown is signalled.
    pub async fn run_wan(
        self: Arc<Self>,
        mut events: mpsc::Receiver<GossipEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_wan_event(&event),
                _ = shutdown.recv() => break,
                else => break,
            }
        }
        tracing::debug!("WAN event dispatch stopped");
    }
}
