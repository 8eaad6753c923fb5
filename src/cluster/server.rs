//! Server coordination core.
//!
//! [`Server`] wires the leader lifecycle, ACL resolution, autopilot, the
//! reconciler, request forwarding and the gossip event dispatchers around
//! the externally provided consensus, gossip and transport handles.
//!
//! # Lifecycle
//!
//! ```text
//! Server::new(config, deps)     validate config, build components
//!        │
//!        ▼
//! Server::start(lan, wan)       spawn leadership monitor and event dispatch
//!        │
//!        ▼
//! Server::shutdown()            signal tasks, wait for them, revoke leadership
//! ```

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};

use super::acl::{AclResolver, Filterable, Policy, PolicyReply, PolicyRequest};
use super::autopilot::Autopilot;
use super::background_tasks::{BackgroundTaskRegistry, TaskStatus};
use super::blocking::blocking_query;
use super::config::ServerConfig;
use super::context::ProcessContext;
use super::error::{Error, Result};
use super::events::{EventDispatcher, GossipEvent};
use super::flood::FloodNotifier;
use super::leader::{LeaderManager, LeadershipState};
use super::membership::ServerDirectory;
use super::operator::Operator;
use super::reconcile::Reconciler;
use super::router::{ForwardOutcome, Forwarder, GET_POLICY_METHOD, RequestInfo, RouteTable};
use super::session_timers::SessionTimers;
use super::tombstone_gc::TombstoneGc;
use super::traits::{Consensus, Gossip, RpcTransport, StateStore};
use super::types::{QueryMeta, QueryOptions};
use super::watch::WatchSet;
use crate::constants::RECONCILE_CHANNEL_SIZE;

/// External collaborators a server is built around.
pub struct ServerDeps {
    pub consensus: Arc<dyn Consensus>,
    pub lan: Arc<dyn Gossip>,
    /// WAN pool. `None` disables cross-datacenter routing and WAN cleanup.
    pub wan: Option<Arc<dyn Gossip>>,
    pub transport: Arc<dyn RpcTransport>,
}

pub struct Server {
    config: Arc<ServerConfig>,
    consensus: Arc<dyn Consensus>,
    resolver: Arc<AclResolver>,
    forwarder: Arc<Forwarder>,
    leader: Arc<LeaderManager>,
    dispatcher: Arc<EventDispatcher>,
    autopilot: Arc<Autopilot>,
    operator: Operator,
    servers: Arc<ServerDirectory>,
    routes: Arc<RouteTable>,
    flood: Arc<FloodNotifier>,
    sessions: Arc<SessionTimers>,
    tombstones: Arc<TombstoneGc>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<BackgroundTaskRegistry>,
}

impl Server {
    pub fn new(config: ServerConfig, deps: ServerDeps) -> Result<Self> {
        config.validate().map_err(|errors| Error::Config(errors.join("; ")))?;
        let config = Arc::new(config);
        let ServerDeps {
            consensus,
            lan,
            wan,
            transport,
        } = deps;

        let ctx = Arc::new(ProcessContext::new());
        let servers = Arc::new(ServerDirectory::new());
        let routes = Arc::new(RouteTable::new());
        let flood = Arc::new(FloodNotifier::new());

        let forwarder = Arc::new(Forwarder::new(
            config.clone(),
            consensus.clone(),
            transport.clone(),
            routes.clone(),
            servers.clone(),
        ));
        let resolver = Arc::new(AclResolver::new(
            config.clone(),
            ctx,
            consensus.clone(),
            forwarder.clone(),
        ));

        let autopilot = Arc::new(Autopilot::new(
            config.clone(),
            consensus.clone(),
            lan.clone(),
            wan,
            transport,
        ));
        let reconciler = Arc::new(
            Reconciler::new(config.clone(), consensus.clone(), lan.clone(), servers.clone())
                .with_remove_dead_signal(autopilot.remove_dead_signal()),
        );
        let sessions = Arc::new(SessionTimers::new(consensus.clone()));
        let tombstones = Arc::new(TombstoneGc::new(
            config.tombstone_ttl,
            config.tombstone_ttl_granularity,
        )?);

        let (reconcile_tx, reconcile_rx) = mpsc::channel(RECONCILE_CHANNEL_SIZE);
        let leader = Arc::new(LeaderManager::new(
            config.clone(),
            consensus.clone(),
            lan.clone(),
            resolver.clone(),
            reconciler,
            autopilot.clone(),
            sessions.clone(),
            tombstones.clone(),
            reconcile_rx,
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            config.clone(),
            consensus.clone(),
            servers.clone(),
            routes.clone(),
            flood.clone(),
            reconcile_tx,
        ));
        let operator = Operator::new(
            config.clone(),
            consensus.clone(),
            lan,
            resolver.clone(),
            autopilot.clone(),
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            consensus,
            resolver,
            forwarder,
            leader,
            dispatcher,
            autopilot,
            operator,
            servers,
            routes,
            flood,
            sessions,
            tombstones,
            shutdown_tx,
            tasks: Mutex::new(BackgroundTaskRegistry::new()),
        })
    }

    /// Start following leadership and dispatching gossip events.
    pub async fn start(
        &self,
        lan_events: mpsc::Receiver<GossipEvent>,
        wan_events: Option<mpsc::Receiver<GossipEvent>>,
    ) {
        let mut tasks = self.tasks.lock().await;

        let leader = self.leader.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.spawn("leadership_monitor", leader.monitor_leadership(shutdown));

        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.spawn("lan_event_dispatch", dispatcher.run_lan(lan_events, shutdown));

        if let Some(wan_events) = wan_events {
            let dispatcher = self.dispatcher.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.spawn("wan_event_dispatch", dispatcher.run_wan(wan_events, shutdown));
        }

        tracing::info!(
            node = %self.config.node_name,
            datacenter = %self.config.datacenter,
            "Server coordination started"
        );
    }

    /// Stop every task and revoke leadership.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.tasks.lock().await.shutdown_all().await;
        self.leader.revoke_leadership().await;
        tracing::info!(node = %self.config.node_name, "Server coordination stopped");
    }

    pub async fn resolve_token(&self, token: &str) -> Result<Option<Arc<Policy>>> {
        self.resolver.resolve_token(token).await
    }

    pub async fn filter_result(&self, token: &str, target: Filterable<'_>) -> Result<()> {
        self.resolver.filter_result(token, target).await
    }

    /// Called by the ACL write path once a token change has been applied.
    pub fn clear_acl(&self, id: &str) {
        self.resolver.clear_acl(id);
    }

    /// Serve a policy fetch, forwarding it to the ACL datacenter's leader
    /// when this server is not that leader.
    pub async fn get_policy(&self, request: &PolicyRequest) -> Result<PolicyReply> {
        let info = RequestInfo::read(&request.datacenter, false);
        let args = serde_json::to_value(request)?;
        match self.forwarder.forward(GET_POLICY_METHOD, &info, &args).await? {
            ForwardOutcome::Local => self.resolver.get_policy(request),
            ForwardOutcome::Remote(reply) => Ok(serde_json::from_value(reply)?),
        }
    }

    pub async fn forward(
        &self,
        method: &str,
        info: &RequestInfo,
        args: &serde_json::Value,
    ) -> Result<ForwardOutcome> {
        self.forwarder.forward(method, info, args).await
    }

    pub async fn blocking_query<T, F>(
        &self,
        opts: &QueryOptions,
        meta: &mut QueryMeta,
        query: F,
    ) -> Result<T>
    where
        F: FnMut(&mut WatchSet, &dyn StateStore) -> Result<(u64, T)> + Send,
        T: Send,
    {
        blocking_query(self.consensus.as_ref(), opts, meta, query).await
    }

    /// Status of the server's long-running tasks.
    pub async fn task_statuses(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks.lock().await.statuses()
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn leadership_state(&self) -> LeadershipState {
        self.leader.state()
    }

    pub fn servers(&self) -> &Arc<ServerDirectory> {
        &self.servers
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn flood(&self) -> &Arc<FloodNotifier> {
        &self.flood
    }

    pub fn autopilot(&self) -> &Arc<Autopilot> {
        &self.autopilot
    }

    pub fn session_timers(&self) -> &Arc<SessionTimers> {
        &self.sessions
    }

    pub fn tombstones(&self) -> &Arc<TombstoneGc> {
        &self.tombstones
    }
}
