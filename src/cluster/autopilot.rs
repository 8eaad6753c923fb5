//! Autopilot: automated server lifecycle while leading.
//!
//! Two loops run on the leader only, started at establishment and stopped on
//! revocation:
//!
//! - **promote/prune** every `autopilot_interval`, and whenever a server was
//!   just added: promote stable non-voters keeping the voter count odd, then
//!   remove dead servers when doing so cannot cost quorum.
//! - **server health** every `server_health_interval`: sample every server's
//!   raft stats and publish a [`ClusterHealth`] snapshot.
//!
//! # Health
//!
//! A server is healthy when gossip reports it alive, it has heard from the
//! leader within `last_contact_threshold`, its last log term equals the
//! leader's and it trails the leader's last index by at most
//! `max_trailing_logs`. `stable_since` moves only when health flips.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};

use super::background_tasks::BackgroundTaskRegistry;
use super::config::ServerConfig;
use super::error::Result;
use super::membership::{MemberStatus, ServerDescriptor, min_raft_protocol, parse_members};
use super::metrics;
use super::stats_fetcher::StatsFetcher;
use super::traits::{Consensus, Gossip, RpcTransport};
use super::types::{AutopilotConfig, Command, RaftServer, ServerStats, Suffrage, num_voters};
use crate::constants::MIN_AUTOPILOT_RAFT_PROTOCOL;

/// Health of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHealth {
    pub id: String,
    pub name: String,
    pub address: String,
    pub serf_status: MemberStatus,
    pub version: String,
    pub leader: bool,
    pub voter: bool,
    /// `None` when the server has never contacted the leader or was not sampled.
    pub last_contact: Option<Duration>,
    pub last_term: u64,
    pub last_index: u64,
    pub healthy: bool,
    pub stable_since: Instant,
}

impl ServerHealth {
    fn compute_healthy(&self, last_term: u64, leader_last_index: u64, config: &AutopilotConfig) -> bool {
        if self.serf_status != MemberStatus::Alive {
            return false;
        }
        match self.last_contact {
            Some(contact) if contact <= config.last_contact_threshold => {}
            _ => return false,
        }
        if self.last_term != last_term {
            return false;
        }
        self.last_index.saturating_add(config.max_trailing_logs) >= leader_last_index
    }

    /// Healthy for at least the stabilization time.
    pub fn is_stable(&self, now: Instant, config: &AutopilotConfig) -> bool {
        self.healthy && now.saturating_duration_since(self.stable_since) >= config.server_stabilization_time
    }
}

/// Snapshot of every server's health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterHealth {
    pub healthy: bool,
    /// Healthy voters beyond quorum.
    pub failure_tolerance: usize,
    pub servers: Vec<ServerHealth>,
}

pub struct Autopilot {
    config: Arc<ServerConfig>,
    consensus: Arc<dyn Consensus>,
    lan: Arc<dyn Gossip>,
    wan: Option<Arc<dyn Gossip>>,
    stats: StatsFetcher,
    health: RwLock<ClusterHealth>,
    remove_dead_tx: mpsc::Sender<()>,
    remove_dead_rx: Arc<Mutex<mpsc::Receiver<()>>>,
    tasks: Mutex<Option<BackgroundTaskRegistry>>,
}

impl Autopilot {
    pub fn new(
        config: Arc<ServerConfig>,
        consensus: Arc<dyn Consensus>,
        lan: Arc<dyn Gossip>,
        wan: Option<Arc<dyn Gossip>>,
        transport: Arc<dyn RpcTransport>,
    ) -> Self {
        let (remove_dead_tx, remove_dead_rx) = mpsc::channel(1);
        let stats = StatsFetcher::new(transport, config.datacenter.clone());
        Self {
            config,
            consensus,
            lan,
            wan,
            stats,
            health: RwLock::new(ClusterHealth::default()),
            remove_dead_tx,
            remove_dead_rx: Arc::new(Mutex::new(remove_dead_rx)),
            tasks: Mutex::new(None),
        }
    }

    /// Sender for the "recheck dead servers" signal. Sends are best effort:
    /// a full channel means a recheck is already pending.
    pub fn remove_dead_signal(&self) -> mpsc::Sender<()> {
        self.remove_dead_tx.clone()
    }

    /// Start both loops. No-op when already running.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return;
        }

        let mut registry = BackgroundTaskRegistry::new();

        let autopilot = self.clone();
        registry.spawn("autopilot_promote_prune", async move {
            autopilot.promote_prune_loop().await;
        });

        let autopilot = self.clone();
        registry.spawn_periodic(
            "autopilot_server_health",
            self.config.server_health_interval,
            move |_| {
                let autopilot = autopilot.clone();
                async move {
                    if let Err(e) = autopilot.update_cluster_health().await {
                        tracing::warn!(error = %e, "Error updating cluster health");
                    }
                }
            },
        );

        *tasks = Some(registry);
        tracing::info!("Autopilot started");
    }

    /// Stop both loops and wait for them to exit.
    pub async fn stop(&self) {
        let registry = self.tasks.lock().await.take();
        if let Some(mut registry) = registry {
            registry.shutdown_all().await;
            tracing::info!("Autopilot stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    async fn promote_prune_loop(self: Arc<Self>) {
        let interval = self.config.autopilot_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut remove_dead = self.remove_dead_rx.lock().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(config) = self.current_config().await {
                        if let Err(e) = self.promote_stable_servers(&config).await {
                            tracing::error!(error = %e, "Error promoting servers");
                        }
                        self.prune_logged(&config).await;
                    }
                }
                Some(()) = remove_dead.recv() => {
                    if let Some(config) = self.current_config().await {
                        self.prune_logged(&config).await;
                    }
                }
            }
        }
    }

    async fn prune_logged(&self, config: &AutopilotConfig) {
        if let Err(e) = self.prune_dead_servers(config).await {
            tracing::error!(error = %e, "Error checking for dead servers to remove");
        }
    }

    async fn current_config(&self) -> Option<AutopilotConfig> {
        match self.get_or_create_config().await {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::error!(error = %e, "Error getting autopilot config");
                None
            }
        }
    }

    /// Stored autopilot configuration, writing the configured defaults when
    /// none exists yet.
    pub async fn get_or_create_config(&self) -> Result<AutopilotConfig> {
        let (_, stored) = self.consensus.state().autopilot_config()?;
        if let Some(config) = stored {
            return Ok(config);
        }

        let config = self.config.autopilot.clone();
        self.consensus
            .apply(Command::AutopilotSetConfig {
                config: config.clone(),
                cas: false,
            })
            .await?;
        tracing::info!("Initialized autopilot configuration");
        Ok(config)
    }

    /// Remove failed gossip servers and consensus servers gossip does not
    /// know, as long as fewer than half of the voters would be removed.
    pub async fn prune_dead_servers(&self, config: &AutopilotConfig) -> Result<()> {
        if !config.cleanup_dead_servers {
            return Ok(());
        }

        let members = parse_members(&self.lan.members());
        let raft = self.consensus.configuration().await?;

        let mut stale: HashMap<String, RaftServer> = raft
            .iter()
            .map(|s| (s.address.clone(), s.clone()))
            .collect();
        let mut failed = Vec::new();
        for member in &members {
            let Some(server) = member.server() else { continue };
            stale.remove(&server.addr.to_string());
            if member.status == MemberStatus::Failed {
                failed.push(member.name.clone());
            }
        }

        let removal_count = failed.len() + stale.len();
        if removal_count == 0 {
            return Ok(());
        }

        let peers = num_voters(&raft);
        if 2 * removal_count >= peers {
            tracing::debug!(removal_count, peers, "Too many dead servers to remove");
            return Ok(());
        }

        for name in &failed {
            tracing::info!(node = %name, "Attempting removal of failed server node");
            let result = self.lan.remove_failed_node(name).await;
            metrics::record_autopilot_action("remove_failed", result.is_ok());
            if let Err(e) = result {
                tracing::warn!(node = %name, error = %e, "Failed to remove failed server node");
            }
            if let Some(wan) = &self.wan {
                let wan_name = format!("{name}.{}", self.config.datacenter);
                if let Err(e) = wan.remove_failed_node(&wan_name).await {
                    tracing::warn!(node = %wan_name, error = %e, "Failed to remove failed WAN server node");
                }
            }
        }

        for server in stale.values() {
            tracing::info!(id = %server.id, address = %server.address, "Attempting removal of stale consensus server");
            let result = if server.is_legacy() {
                self.consensus.remove_peer(&server.address).await
            } else {
                self.consensus.remove_server(&server.id).await
            };
            metrics::record_autopilot_action("remove_stale", result.is_ok());
            result?;
        }
        Ok(())
    }

    /// Promote non-voters that have been healthy for the stabilization time.
    ///
    /// An even voter count gets one promotion to make it odd; the rest are
    /// promoted in pairs. Returns the ids promoted.
    pub async fn promote_stable_servers(&self, config: &AutopilotConfig) -> Result<Vec<String>> {
        let members = parse_members(&self.lan.members());
        let min_raft = min_raft_protocol(&members, &self.config.datacenter)?;
        if min_raft < MIN_AUTOPILOT_RAFT_PROTOCOL {
            return Ok(Vec::new());
        }

        let now = Instant::now();
        let raft = self.consensus.configuration().await?;
        let mut voters = 0usize;
        let mut candidates = Vec::new();
        for server in &raft {
            if server.is_potential_voter() {
                voters += 1;
            } else if self
                .server_health(&server.id)
                .is_some_and(|h| h.is_stable(now, config))
            {
                candidates.push(server.clone());
            }
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut promote: Vec<&RaftServer> = Vec::new();
        let mut rest = candidates.as_slice();
        if voters % 2 == 0 {
            promote.push(&rest[0]);
            rest = &rest[1..];
        }
        for pair in rest.chunks_exact(2) {
            promote.extend(pair);
        }

        let mut promoted = Vec::with_capacity(promote.len());
        for server in promote {
            tracing::info!(id = %server.id, address = %server.address, "Promoting server to voter");
            let result = self.consensus.add_voter(&server.id, &server.address).await;
            metrics::record_autopilot_action("promote", result.is_ok());
            result?;
            promoted.push(server.id.clone());
        }

        if !promoted.is_empty() {
            let _ = self.remove_dead_tx.try_send(());
        }
        Ok(promoted)
    }

    /// Sample every server and publish a new health snapshot.
    pub async fn update_cluster_health(&self) -> Result<()> {
        let members = parse_members(&self.lan.members());
        let min_raft = min_raft_protocol(&members, &self.config.datacenter)?;
        if min_raft < MIN_AUTOPILOT_RAFT_PROTOCOL {
            return Ok(());
        }

        let (_, stored) = self.consensus.state().autopilot_config()?;
        let Some(config) = stored else {
            return Ok(());
        };

        let servers: HashMap<String, ServerDescriptor> = members
            .iter()
            .filter(|m| m.status != MemberStatus::Left)
            .filter_map(|m| m.server())
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        let raft = self.consensus.configuration().await?;
        let target_last_index = self.consensus.last_index();
        let last_term = self.consensus.last_log_term();

        let fetch_list: Vec<ServerDescriptor> = raft
            .iter()
            .filter_map(|s| servers.get(&s.id).cloned())
            .collect();
        let deadline = tokio::time::Instant::now() + self.config.server_health_interval / 2;
        let fetched = self.stats.fetch(&fetch_list, deadline).await;

        let leader = self.consensus.leader();
        let previous: HashMap<String, (bool, Instant)> = self
            .health
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .servers
            .iter()
            .map(|h| (h.id.clone(), (h.healthy, h.stable_since)))
            .collect();

        let now = Instant::now();
        let mut health = ClusterHealth::default();
        let mut voters = 0usize;
        let mut healthy_count = 0usize;
        let mut healthy_voters = 0usize;

        for server in &raft {
            let parts = servers.get(&server.id);
            let stats = fetched.get(&server.id).cloned().unwrap_or_default();
            let sampled = parts.is_some() && fetched.contains_key(&server.id);

            let mut h = ServerHealth {
                id: server.id.clone(),
                name: parts.map(|p| p.name.clone()).unwrap_or_default(),
                address: server.address.clone(),
                serf_status: parts.map(|p| p.status).unwrap_or(MemberStatus::None),
                version: parts.map(|p| p.build.clone()).unwrap_or_default(),
                leader: leader.as_deref() == Some(server.address.as_str()),
                voter: server.suffrage == Suffrage::Voter,
                last_contact: None,
                last_term: 0,
                last_index: 0,
                healthy: false,
                stable_since: now,
            };
            if sampled {
                apply_stats(&mut h, &stats);
                h.healthy = h.compute_healthy(last_term, target_last_index, &config);
            }
            if let Some((was_healthy, since)) = previous.get(&server.id)
                && *was_healthy == h.healthy
            {
                h.stable_since = *since;
            }

            if h.voter {
                voters += 1;
            }
            if h.healthy {
                healthy_count += 1;
                if h.voter {
                    healthy_voters += 1;
                }
            }
            health.servers.push(h);
        }

        health.healthy = healthy_count == raft.len();
        let quorum = voters / 2 + 1;
        health.failure_tolerance = healthy_voters.saturating_sub(quorum);

        metrics::set_autopilot_health(health.healthy, health.failure_tolerance);
        tracing::debug!(
            healthy = health.healthy,
            failure_tolerance = health.failure_tolerance,
            servers = health.servers.len(),
            "Updated cluster health"
        );
        *self.health.write().unwrap_or_else(|e| e.into_inner()) = health;
        Ok(())
    }

    /// Latest health snapshot.
    pub fn cluster_health(&self) -> ClusterHealth {
        self.health.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn server_health(&self, id: &str) -> Option<ServerHealth> {
        self.health
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .servers
            .iter()
            .find(|h| h.id == id)
            .cloned()
    }
}

fn apply_stats(health: &mut ServerHealth, stats: &ServerStats) {
    health.last_contact = stats.last_contact;
    health.last_term = stats.last_term;
    health.last_index = stats.last_index;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(status: MemberStatus, contact: Option<Duration>, term: u64, index: u64) -> ServerHealth {
        ServerHealth {
            id: "a".to_string(),
            name: "a".to_string(),
            address: "10.0.0.1:8300".to_string(),
            serf_status: status,
            version: String::new(),
            leader: false,
            voter: true,
            last_contact: contact,
            last_term: term,
            last_index: index,
            healthy: false,
            stable_since: Instant::now(),
        }
    }

    #[test]
    fn test_healthy_rules() {
        let config = AutopilotConfig::default();
        let ok = Some(Duration::from_millis(10));

        assert!(health(MemberStatus::Alive, ok, 5, 100).compute_healthy(5, 300, &config));
        assert!(!health(MemberStatus::Failed, ok, 5, 100).compute_healthy(5, 300, &config));
        assert!(!health(MemberStatus::Alive, None, 5, 100).compute_healthy(5, 300, &config));
        assert!(
            !health(MemberStatus::Alive, Some(Duration::from_secs(1)), 5, 100)
                .compute_healthy(5, 300, &config)
        );
        assert!(!health(MemberStatus::Alive, ok, 4, 100).compute_healthy(5, 300, &config));
        assert!(!health(MemberStatus::Alive, ok, 5, 49).compute_healthy(5, 300, &config));
    }

    #[test]
    fn test_stability() {
        let config = AutopilotConfig {
            server_stabilization_time: Duration::from_secs(10),
            ..AutopilotConfig::default()
        };
        let mut h = health(MemberStatus::Alive, None, 0, 0);
        h.healthy = true;
        h.stable_since = Instant::now() - Duration::from_secs(11);
        assert!(h.is_stable(Instant::now(), &config));

        h.stable_since = Instant::now();
        assert!(!h.is_stable(Instant::now(), &config));

        h.healthy = false;
        h.stable_since = Instant::now() - Duration::from_secs(60);
        assert!(!h.is_stable(Instant::now(), &config));
    }
}
