//! In-memory doubles of the external collaborators, for testing.
//!
//! - [`MemoryStore`]: a versioned catalog with per-table watch channels
//! - [`MockConsensus`]: a single-node consensus log applying to a [`MemoryStore`]
//! - [`MockGossip`]: a scripted member list recording user events and removals
//! - [`MockTransport`]: per-method canned replies with per-address delays
//! - [`MockPolicySource`]: scripted ACL datacenter replies
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! consulate = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::acl::policy::{make_etag, rule_id};
use super::acl::resolver::{PolicyReply, PolicyRequest, PolicySource};
use super::error::{Error, Result};
use super::membership::{Member, MemberStatus};
use super::traits::{Consensus, Gossip, RpcTransport, StateStore};
use super::types::{
    AclToken, ApplyResponse, AutopilotConfig, Command, HealthCheck, HealthStatus, Node,
    NodeService, RaftServer, RegisterRequest, Session, Suffrage,
};
use super::watch::{WatchSet, add_to};
use crate::constants::SERVER_ROLE_TAG;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// MemoryStore
// =============================================================================

#[derive(Default)]
struct Tables {
    index: u64,
    nodes: BTreeMap<String, Node>,
    services: BTreeMap<String, BTreeMap<String, NodeService>>,
    checks: BTreeMap<(String, String), HealthCheck>,
    sessions: BTreeMap<String, Session>,
    acls: BTreeMap<String, AclToken>,
    autopilot: Option<AutopilotConfig>,
    autopilot_index: u64,
    nodes_index: u64,
    services_index: u64,
    checks_index: u64,
    sessions_index: u64,
    acls_index: u64,
    reaped_index: u64,
}

/// In-memory state store.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    nodes_tx: watch::Sender<u64>,
    services_tx: watch::Sender<u64>,
    checks_tx: watch::Sender<u64>,
    sessions_tx: watch::Sender<u64>,
    acls_tx: watch::Sender<u64>,
    abandon_tx: watch::Sender<u64>,
}

#[derive(Default)]
struct Touched {
    nodes: bool,
    services: bool,
    checks: bool,
    sessions: bool,
    acls: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            nodes_tx: watch::channel(0).0,
            services_tx: watch::channel(0).0,
            checks_tx: watch::channel(0).0,
            sessions_tx: watch::channel(0).0,
            acls_tx: watch::channel(0).0,
            abandon_tx: watch::channel(0).0,
        }
    }

    /// Current raft index of the store.
    pub fn index(&self) -> u64 {
        read(&self.tables).index
    }

    /// Highest index passed to a tombstone reap.
    pub fn reaped_index(&self) -> u64 {
        read(&self.tables).reaped_index
    }

    /// Mark this store as replaced.
    pub fn abandon(&self) {
        self.abandon_tx.send_replace(1);
    }

    fn commit(&self, f: impl FnOnce(&mut Tables, u64, &mut Touched) -> bool) -> ApplyResponse {
        let mut touched = Touched::default();
        let (index, success) = {
            let mut tables = write(&self.tables);
            tables.index += 1;
            let index = tables.index;
            let success = f(&mut tables, index, &mut touched);
            if touched.nodes {
                tables.nodes_index = index;
            }
            if touched.services {
                tables.services_index = index;
            }
            if touched.checks {
                tables.checks_index = index;
            }
            if touched.sessions {
                tables.sessions_index = index;
            }
            if touched.acls {
                tables.acls_index = index;
            }
            (index, success)
        };

        for (hit, tx) in [
            (touched.nodes, &self.nodes_tx),
            (touched.services, &self.services_tx),
            (touched.checks, &self.checks_tx),
            (touched.sessions, &self.sessions_tx),
            (touched.acls, &self.acls_tx),
        ] {
            if hit {
                tx.send_replace(index);
            }
        }
        ApplyResponse { index, success }
    }

    /// Apply a command as the replicated state machine would.
    pub fn apply(&self, command: &Command) -> ApplyResponse {
        self.commit(|t, index, touched| match command {
            Command::Register(req) => {
                register(t, index, touched, req);
                true
            }
            Command::Deregister(req) => {
                t.nodes.remove(&req.node);
                t.services.remove(&req.node);
                t.checks.retain(|(node, _), _| node != &req.node);
                t.sessions.retain(|_, s| s.node != req.node);
                touched.nodes = true;
                touched.services = true;
                touched.checks = true;
                touched.sessions = true;
                true
            }
            Command::SessionDestroy { id } => {
                t.sessions.remove(id);
                touched.sessions = true;
                true
            }
            Command::AclSet(token) => {
                let mut token = token.clone();
                token.modify_index = index;
                t.acls.insert(token.id.clone(), token);
                touched.acls = true;
                true
            }
            Command::AutopilotSetConfig { config, cas } => {
                let stored_index = t.autopilot.as_ref().map(|c| c.modify_index).unwrap_or(0);
                if *cas && config.modify_index != stored_index {
                    return false;
                }
                let mut config = config.clone();
                config.create_index = t.autopilot.as_ref().map(|c| c.create_index).unwrap_or(index);
                config.modify_index = index;
                t.autopilot = Some(config);
                t.autopilot_index = index;
                true
            }
            Command::TombstoneReap { index: reap } => {
                t.reaped_index = t.reaped_index.max(*reap);
                true
            }
        })
    }

    // -------------------------------------------------------------------------
    // Setup helpers
    // -------------------------------------------------------------------------

    pub fn insert_acl(&self, token: AclToken) -> u64 {
        self.apply(&Command::AclSet(token)).index
    }

    pub fn insert_session(&self, session: Session) -> u64 {
        self.commit(|t, index, touched| {
            let mut session = session;
            session.create_index = index;
            t.sessions.insert(session.id.clone(), session);
            touched.sessions = true;
            true
        })
        .index
    }

    /// Register a node, optionally with a serf check in the given state.
    pub fn register_node(&self, node: &str, address: &str, serf: Option<HealthStatus>) -> u64 {
        self.apply(&Command::Register(RegisterRequest {
            datacenter: "dc1".to_string(),
            node: node.to_string(),
            id: String::new(),
            address: address.to_string(),
            service: None,
            check: serf.map(|status| HealthCheck {
                node: node.to_string(),
                check_id: crate::constants::SERF_CHECK_ID.to_string(),
                name: crate::constants::SERF_CHECK_NAME.to_string(),
                status,
                output: String::new(),
                service_id: String::new(),
                service_name: String::new(),
                modify_index: 0,
            }),
            skip_node_update: false,
        }))
        .index
    }

    pub fn register_service(&self, node: &str, service: NodeService) -> u64 {
        self.commit(|t, index, touched| {
            let mut service = service;
            service.modify_index = index;
            t.services
                .entry(node.to_string())
                .or_default()
                .insert(service.id.clone(), service);
            touched.services = true;
            true
        })
        .index
    }
}

fn register(t: &mut Tables, index: u64, touched: &mut Touched, req: &RegisterRequest) {
    let exists = t.nodes.contains_key(&req.node);
    if !exists || !req.skip_node_update {
        let entry = t.nodes.entry(req.node.clone()).or_default();
        entry.id = req.id.clone();
        entry.node = req.node.clone();
        entry.address = req.address.clone();
        entry.datacenter = req.datacenter.clone();
        entry.modify_index = index;
        touched.nodes = true;
    } else if let Some(node) = t.nodes.get_mut(&req.node)
        && node.address != req.address
    {
        node.address = req.address.clone();
        node.modify_index = index;
        touched.nodes = true;
    }

    if let Some(service) = &req.service {
        let mut service = service.clone();
        service.modify_index = index;
        t.services
            .entry(req.node.clone())
            .or_default()
            .insert(service.id.clone(), service);
        touched.services = true;
    }

    if let Some(check) = &req.check {
        let mut check = check.clone();
        check.node = req.node.clone();
        check.modify_index = index;
        t.checks
            .insert((req.node.clone(), check.check_id.clone()), check);
        touched.checks = true;
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStore {
    fn get_node(&self, ws: Option<&mut WatchSet>, node: &str) -> Result<(u64, Option<Node>)> {
        add_to(ws, || self.nodes_tx.subscribe());
        let t = read(&self.tables);
        Ok((t.nodes_index, t.nodes.get(node).cloned()))
    }

    fn nodes(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Vec<Node>)> {
        add_to(ws, || self.nodes_tx.subscribe());
        let t = read(&self.tables);
        Ok((t.nodes_index, t.nodes.values().cloned().collect()))
    }

    fn node_services(
        &self,
        ws: Option<&mut WatchSet>,
        node: &str,
    ) -> Result<(u64, Vec<NodeService>)> {
        add_to(ws, || self.services_tx.subscribe());
        let t = read(&self.tables);
        let services = t
            .services
            .get(node)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        Ok((t.services_index, services))
    }

    fn node_checks(
        &self,
        ws: Option<&mut WatchSet>,
        node: &str,
    ) -> Result<(u64, Vec<HealthCheck>)> {
        add_to(ws, || self.checks_tx.subscribe());
        let t = read(&self.tables);
        let checks = t
            .checks
            .iter()
            .filter(|((n, _), _)| n == node)
            .map(|(_, c)| c.clone())
            .collect();
        Ok((t.checks_index, checks))
    }

    fn checks_in_state(
        &self,
        ws: Option<&mut WatchSet>,
        state: Option<HealthStatus>,
    ) -> Result<(u64, Vec<HealthCheck>)> {
        add_to(ws, || self.checks_tx.subscribe());
        let t = read(&self.tables);
        let checks = t
            .checks
            .values()
            .filter(|c| state.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        Ok((t.checks_index, checks))
    }

    fn sessions(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Vec<Session>)> {
        add_to(ws, || self.sessions_tx.subscribe());
        let t = read(&self.tables);
        Ok((t.sessions_index, t.sessions.values().cloned().collect()))
    }

    fn session_get(&self, ws: Option<&mut WatchSet>, id: &str) -> Result<(u64, Option<Session>)> {
        add_to(ws, || self.sessions_tx.subscribe());
        let t = read(&self.tables);
        Ok((t.sessions_index, t.sessions.get(id).cloned()))
    }

    fn acl_get(&self, ws: Option<&mut WatchSet>, id: &str) -> Result<(u64, Option<AclToken>)> {
        add_to(ws, || self.acls_tx.subscribe());
        let t = read(&self.tables);
        Ok((t.acls_index, t.acls.get(id).cloned()))
    }

    fn acl_list(&self, ws: Option<&mut WatchSet>) -> Result<(u64, Vec<AclToken>)> {
        add_to(ws, || self.acls_tx.subscribe());
        let t = read(&self.tables);
        Ok((t.acls_index, t.acls.values().cloned().collect()))
    }

    fn autopilot_config(&self) -> Result<(u64, Option<AutopilotConfig>)> {
        let t = read(&self.tables);
        Ok((t.autopilot_index, t.autopilot.clone()))
    }

    fn abandon_handle(&self) -> watch::Receiver<u64> {
        self.abandon_tx.subscribe()
    }
}

// =============================================================================
// MockConsensus
// =============================================================================

/// Single-node consensus double.
pub struct MockConsensus {
    store: RwLock<Arc<MemoryStore>>,
    leader_tx: watch::Sender<bool>,
    is_leader: AtomicBool,
    leader_addr: RwLock<Option<String>>,
    last_contact: RwLock<Duration>,
    last_log_term: AtomicU64,
    applied: Mutex<Vec<Command>>,
    apply_error: Mutex<Option<Error>>,
    configuration: Mutex<Vec<RaftServer>>,
    membership_ops: Mutex<Vec<String>>,
    barrier_failures: AtomicU32,
    barrier_calls: AtomicU32,
    verify_calls: AtomicU32,
}

impl MockConsensus {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Arc::new(MemoryStore::new())),
            leader_tx: watch::channel(false).0,
            is_leader: AtomicBool::new(false),
            leader_addr: RwLock::new(None),
            last_contact: RwLock::new(Duration::ZERO),
            last_log_term: AtomicU64::new(1),
            applied: Mutex::new(Vec::new()),
            apply_error: Mutex::new(None),
            configuration: Mutex::new(Vec::new()),
            membership_ops: Mutex::new(Vec::new()),
            barrier_failures: AtomicU32::new(0),
            barrier_calls: AtomicU32::new(0),
            verify_calls: AtomicU32::new(0),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        read(&self.store).clone()
    }

    /// Replace the store, as a snapshot restore would, abandoning the old one.
    pub fn restore(&self) -> Arc<MemoryStore> {
        let fresh = Arc::new(MemoryStore::new());
        let old = std::mem::replace(&mut *write(&self.store), fresh.clone());
        old.abandon();
        fresh
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::SeqCst);
        self.leader_tx.send_replace(leader);
    }

    pub fn set_leader_addr(&self, addr: Option<&str>) {
        *write(&self.leader_addr) = addr.map(str::to_string);
    }

    pub fn set_last_contact(&self, contact: Duration) {
        *write(&self.last_contact) = contact;
    }

    pub fn set_last_log_term(&self, term: u64) {
        self.last_log_term.store(term, Ordering::SeqCst);
    }

    /// Make every apply fail with `err`, or succeed again with `None`.
    pub fn fail_applies_with(&self, err: Option<Error>) {
        *lock(&self.apply_error) = err;
    }

    /// Fail the next `n` barriers.
    pub fn fail_barriers(&self, n: u32) {
        self.barrier_failures.store(n, Ordering::SeqCst);
    }

    pub fn barrier_calls(&self) -> u32 {
        self.barrier_calls.load(Ordering::SeqCst)
    }

    pub fn verify_leader_calls(&self) -> u32 {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<Command> {
        lock(&self.applied).clone()
    }

    pub fn apply_count(&self) -> usize {
        lock(&self.applied).len()
    }

    pub fn applied_sessions_destroyed(&self) -> Vec<String> {
        lock(&self.applied)
            .iter()
            .filter_map(|c| match c {
                Command::SessionDestroy { id } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_configuration(&self, servers: Vec<RaftServer>) {
        *lock(&self.configuration) = servers;
    }

    pub fn configuration_snapshot(&self) -> Vec<RaftServer> {
        lock(&self.configuration).clone()
    }

    /// Membership changes in call order, e.g. `add_nonvoter:s2`.
    pub fn membership_ops(&self) -> Vec<String> {
        lock(&self.membership_ops).clone()
    }

    fn record_op(&self, op: String) {
        lock(&self.membership_ops).push(op);
    }
}

impl Default for MockConsensus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Consensus for MockConsensus {
    fn state(&self) -> Arc<dyn StateStore> {
        self.store()
    }

    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn leader(&self) -> Option<String> {
        read(&self.leader_addr).clone()
    }

    fn last_contact(&self) -> Duration {
        *read(&self.last_contact)
    }

    fn last_index(&self) -> u64 {
        self.store().index()
    }

    fn last_log_term(&self) -> u64 {
        self.last_log_term.load(Ordering::SeqCst)
    }

    fn leadership_watch(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    async fn barrier(&self, _timeout: Duration) -> Result<()> {
        self.barrier_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.barrier_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.barrier_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Timeout("barrier".to_string()));
        }
        Ok(())
    }

    async fn verify_leader(&self) -> Result<()> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_leader() {
            Ok(())
        } else {
            Err(Error::NoLeader)
        }
    }

    async fn apply(&self, command: Command) -> Result<ApplyResponse> {
        if let Some(err) = lock(&self.apply_error).clone() {
            return Err(err);
        }
        let response = self.store().apply(&command);
        lock(&self.applied).push(command);
        Ok(response)
    }

    async fn configuration(&self) -> Result<Vec<RaftServer>> {
        Ok(self.configuration_snapshot())
    }

    async fn add_voter(&self, id: &str, address: &str) -> Result<()> {
        self.record_op(format!("add_voter:{id}"));
        let mut servers = lock(&self.configuration);
        match servers.iter_mut().find(|s| s.id == id) {
            Some(server) => {
                server.address = address.to_string();
                server.suffrage = Suffrage::Voter;
            }
            None => servers.push(RaftServer {
                id: id.to_string(),
                address: address.to_string(),
                suffrage: Suffrage::Voter,
            }),
        }
        Ok(())
    }

    async fn add_nonvoter(&self, id: &str, address: &str) -> Result<()> {
        self.record_op(format!("add_nonvoter:{id}"));
        let mut servers = lock(&self.configuration);
        match servers.iter_mut().find(|s| s.id == id) {
            Some(server) => server.address = address.to_string(),
            None => servers.push(RaftServer {
                id: id.to_string(),
                address: address.to_string(),
                suffrage: Suffrage::Nonvoter,
            }),
        }
        Ok(())
    }

    async fn add_peer(&self, address: &str) -> Result<()> {
        self.record_op(format!("add_peer:{address}"));
        let mut servers = lock(&self.configuration);
        if !servers.iter().any(|s| s.address == address) {
            servers.push(RaftServer {
                id: address.to_string(),
                address: address.to_string(),
                suffrage: Suffrage::Voter,
            });
        }
        Ok(())
    }

    async fn remove_server(&self, id: &str) -> Result<()> {
        self.record_op(format!("remove_server:{id}"));
        lock(&self.configuration).retain(|s| s.id != id);
        Ok(())
    }

    async fn remove_peer(&self, address: &str) -> Result<()> {
        self.record_op(format!("remove_peer:{address}"));
        lock(&self.configuration).retain(|s| s.address != address);
        Ok(())
    }
}

// =============================================================================
// MockGossip
// =============================================================================

/// Gossip pool double with a settable member list.
pub struct MockGossip {
    local: Member,
    members: RwLock<Vec<Member>>,
    user_events: Mutex<Vec<(String, Vec<u8>)>>,
    removed_failed: Mutex<Vec<String>>,
}

impl MockGossip {
    pub fn new(local: Member) -> Self {
        Self {
            members: RwLock::new(vec![local.clone()]),
            local,
            user_events: Mutex::new(Vec::new()),
            removed_failed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_members(&self, members: Vec<Member>) {
        *write(&self.members) = members;
    }

    /// Add a member, replacing any with the same name.
    pub fn upsert_member(&self, member: Member) {
        let mut members = write(&self.members);
        members.retain(|m| m.name != member.name);
        members.push(member);
    }

    pub fn set_status(&self, name: &str, status: MemberStatus) {
        if let Some(member) = write(&self.members).iter_mut().find(|m| m.name == name) {
            member.status = status;
        }
    }

    pub fn user_events(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.user_events).clone()
    }

    pub fn removed_failed(&self) -> Vec<String> {
        lock(&self.removed_failed).clone()
    }
}

#[async_trait]
impl Gossip for MockGossip {
    fn members(&self) -> Vec<Member> {
        read(&self.members).clone()
    }

    fn local_member(&self) -> Member {
        self.local.clone()
    }

    async fn user_event(&self, name: &str, payload: Vec<u8>, _coalesce: bool) -> Result<()> {
        lock(&self.user_events).push((name.to_string(), payload));
        Ok(())
    }

    async fn remove_failed_node(&self, name: &str) -> Result<()> {
        lock(&self.removed_failed).push(name.to_string());
        self.set_status(name, MemberStatus::Left);
        Ok(())
    }

    async fn join(&self, addrs: &[String]) -> Result<usize> {
        Ok(addrs.len())
    }
}

/// A server member with tags for `datacenter`, raft protocol and port 8300.
/// The node id equals the name.
pub fn server_member(name: &str, ip: &str, datacenter: &str, raft_vsn: u32) -> Member {
    let tags = HashMap::from([
        ("role".to_string(), SERVER_ROLE_TAG.to_string()),
        ("dc".to_string(), datacenter.to_string()),
        ("id".to_string(), name.to_string()),
        ("port".to_string(), "8300".to_string()),
        ("build".to_string(), "1.0.0".to_string()),
        ("raft_vsn".to_string(), raft_vsn.to_string()),
    ]);
    Member {
        name: name.to_string(),
        addr: ip.parse().unwrap_or(IpAddr::from([127, 0, 0, 1])),
        port: 8301,
        tags,
        status: MemberStatus::Alive,
    }
}

/// A client member of `datacenter`.
pub fn client_member(name: &str, ip: &str, datacenter: &str) -> Member {
    let tags = HashMap::from([
        ("role".to_string(), "node".to_string()),
        ("dc".to_string(), datacenter.to_string()),
        ("id".to_string(), name.to_string()),
    ]);
    Member {
        name: name.to_string(),
        addr: ip.parse().unwrap_or(IpAddr::from([127, 0, 0, 1])),
        port: 8301,
        tags,
        status: MemberStatus::Alive,
    }
}

/// The consensus configuration entry of a member built by [`server_member`].
pub fn raft_server(name: &str, ip: &str, suffrage: Suffrage) -> RaftServer {
    RaftServer {
        id: name.to_string(),
        address: format!("{ip}:8300"),
        suffrage,
    }
}

// =============================================================================
// MockTransport
// =============================================================================

type Handler = Arc<dyn Fn(SocketAddr, serde_json::Value) -> Result<serde_json::Value> + Send + Sync>;

/// Transport double answering from per-method handlers.
#[derive(Default)]
pub struct MockTransport {
    handlers: RwLock<HashMap<String, Handler>>,
    delays: RwLock<HashMap<SocketAddr, Duration>>,
    calls: Mutex<Vec<(String, SocketAddr, String)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `method` with `reply`.
    pub fn respond(&self, method: &str, reply: serde_json::Value) {
        self.handle(method, move |_, _| Ok(reply.clone()));
    }

    pub fn handle<F>(&self, method: &str, handler: F)
    where
        F: Fn(SocketAddr, serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        write(&self.handlers).insert(method.to_string(), Arc::new(handler));
    }

    /// Delay every reply from `addr`.
    pub fn delay(&self, addr: SocketAddr, delay: Duration) {
        write(&self.delays).insert(addr, delay);
    }

    /// Calls made so far as `(datacenter, address, method)`.
    pub fn calls(&self) -> Vec<(String, SocketAddr, String)> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, addr: SocketAddr) -> usize {
        lock(&self.calls).iter().filter(|(_, a, _)| *a == addr).count()
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn call(
        &self,
        datacenter: &str,
        addr: SocketAddr,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        lock(&self.calls).push((datacenter.to_string(), addr, method.to_string()));

        let delay = read(&self.delays).get(&addr).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handler = read(&self.handlers).get(method).cloned();
        match handler {
            Some(handler) => handler(addr, args),
            None => Err(Error::rpc(method, addr, "unknown method")),
        }
    }
}

// =============================================================================
// MockPolicySource
// =============================================================================

/// Scripted ACL datacenter.
#[derive(Default)]
pub struct MockPolicySource {
    replies: RwLock<HashMap<String, PolicyReply>>,
    error: RwLock<Option<Error>>,
    requests: Mutex<Vec<PolicyRequest>>,
}

impl MockPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `rules` on top of `parent` for token `id`.
    pub fn set_reply(&self, id: &str, parent: &str, rules: &str, ttl: Duration) {
        let reply = PolicyReply {
            etag: make_etag(parent, &rule_id(rules)),
            parent: parent.to_string(),
            policy: Some(rules.to_string()),
            ttl,
        };
        write(&self.replies).insert(id.to_string(), reply);
    }

    /// Fail every fetch with `err`, or serve replies again with `None`.
    pub fn fail_with(&self, err: Option<Error>) {
        *write(&self.error) = err;
    }

    pub fn requests(&self) -> Vec<PolicyRequest> {
        lock(&self.requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl PolicySource for MockPolicySource {
    async fn get_policy(&self, request: &PolicyRequest) -> Result<PolicyReply> {
        lock(&self.requests).push(request.clone());
        if let Some(err) = read(&self.error).clone() {
            return Err(err);
        }
        let mut reply = read(&self.replies)
            .get(&request.acl)
            .cloned()
            .ok_or(Error::AclNotFound)?;
        if request.etag.as_deref() == Some(reply.etag.as_str()) {
            reply.policy = None;
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_watch_fires_on_write() {
        let store = MemoryStore::new();
        let mut ws = WatchSet::new();
        let (index, nodes) = store.nodes(Some(&mut ws)).unwrap();
        assert_eq!(index, 0);
        assert!(nodes.is_empty());

        store.register_node("n1", "10.0.0.1", None);
        tokio::time::timeout(Duration::from_secs(1), ws.wait())
            .await
            .unwrap();
        assert_eq!(store.nodes(None).unwrap().0, 1);
    }

    #[tokio::test]
    async fn test_autopilot_cas() {
        let consensus = MockConsensus::new();
        let config = AutopilotConfig::default();
        let first = consensus
            .apply(Command::AutopilotSetConfig {
                config: config.clone(),
                cas: false,
            })
            .await
            .unwrap();
        assert!(first.success);

        let stale = consensus
            .apply(Command::AutopilotSetConfig {
                config: config.clone(),
                cas: true,
            })
            .await
            .unwrap();
        assert!(!stale.success);

        let (_, stored) = consensus.state().autopilot_config().unwrap();
        let fresh = consensus
            .apply(Command::AutopilotSetConfig {
                config: stored.unwrap(),
                cas: true,
            })
            .await
            .unwrap();
        assert!(fresh.success);
    }

    #[tokio::test]
    async fn test_restore_abandons_old_store() {
        let consensus = MockConsensus::new();
        let mut abandon = consensus.state().abandon_handle();
        consensus.restore();
        tokio::time::timeout(Duration::from_secs(1), abandon.changed())
            .await
            .unwrap()
            .unwrap();
    }
}
