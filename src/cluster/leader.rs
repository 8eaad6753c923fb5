//! Leader lifecycle.
//!
//! [`LeaderManager::monitor_leadership`] follows the consensus leadership
//! stream. Gaining leadership spawns the leader loop; losing it stops the
//! loop and waits for it to exit.
//!
//! The leader loop:
//!
//! 1. broadcasts the new-leader user event over LAN gossip
//! 2. issues a barrier so every committed entry is applied locally
//! 3. establishes leadership once per term (ACL bootstrap, tombstone GC,
//!    session timers, autopilot)
//! 4. reconciles gossip membership into the catalog
//! 5. waits for the next reconcile tick, a queued member event, a tombstone
//!    expiry, or the stop signal
//!
//! A failed barrier, establishment or reconcile skips straight to the wait
//! and is retried at the next tick. Leadership is always revoked when the
//! loop exits.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::acl::AclResolver;
use super::autopilot::Autopilot;
use super::config::ServerConfig;
use super::error::{Error, Result};
use super::metrics;
use super::reconcile::{ReconcileEvent, Reconciler};
use super::session_timers::SessionTimers;
use super::tombstone_gc::TombstoneGc;
use super::traits::{Consensus, Gossip};
use super::types::{AclToken, AclTokenType, Command};
use crate::constants::{ANONYMOUS_TOKEN, NEW_LEADER_EVENT};

/// Leadership state of this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    NotLeader,
    /// Leader loop running, establishment not yet complete.
    Establishing,
    Leading,
}

impl LeadershipState {
    fn gauge(self) -> i64 {
        match self {
            LeadershipState::NotLeader => 0,
            LeadershipState::Establishing => 1,
            LeadershipState::Leading => 2,
        }
    }
}

pub struct LeaderManager {
    config: Arc<ServerConfig>,
    consensus: Arc<dyn Consensus>,
    lan: Arc<dyn Gossip>,
    resolver: Arc<AclResolver>,
    reconciler: Arc<Reconciler>,
    autopilot: Arc<Autopilot>,
    sessions: Arc<SessionTimers>,
    tombstones: Arc<TombstoneGc>,
    reconcile_rx: Mutex<mpsc::Receiver<ReconcileEvent>>,
    state: RwLock<LeadershipState>,
}

impl LeaderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ServerConfig>,
        consensus: Arc<dyn Consensus>,
        lan: Arc<dyn Gossip>,
        resolver: Arc<AclResolver>,
        reconciler: Arc<Reconciler>,
        autopilot: Arc<Autopilot>,
        sessions: Arc<SessionTimers>,
        tombstones: Arc<TombstoneGc>,
        reconcile_rx: mpsc::Receiver<ReconcileEvent>,
    ) -> Self {
        Self {
            config,
            consensus,
            lan,
            resolver,
            reconciler,
            autopilot,
            sessions,
            tombstones,
            reconcile_rx: Mutex::new(reconcile_rx),
            state: RwLock::new(LeadershipState::NotLeader),
        }
    }

    pub fn state(&self) -> LeadershipState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: LeadershipState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
        metrics::set_leadership_state(state.gauge());
    }

    /// Follow leadership changes until shutdown.
    pub async fn monitor_leadership(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut leadership = self.consensus.leadership_watch();
        let mut running: Option<(oneshot::Sender<()>, JoinHandle<()>)> = None;

        if *leadership.borrow_and_update() {
            running = Some(self.spawn_leader_loop(&shutdown));
        }

        loop {
            tokio::select! {
                changed = leadership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_leader = *leadership.borrow_and_update();
                    if is_leader && running.is_none() {
                        tracing::info!(node = %self.config.node_name, "Cluster leadership acquired");
                        metrics::record_leadership_transition("acquired");
                        running = Some(self.spawn_leader_loop(&shutdown));
                    } else if !is_leader && let Some((stop, handle)) = running.take() {
                        tracing::info!(node = %self.config.node_name, "Cluster leadership lost");
                        metrics::record_leadership_transition("lost");
                        let _ = stop.send(());
                        let _ = handle.await;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        if let Some((stop, handle)) = running.take() {
            let _ = stop.send(());
            let _ = handle.await;
        }
        tracing::debug!("Leadership monitor stopped");
    }

    fn spawn_leader_loop(
        self: &Arc<Self>,
        shutdown: &broadcast::Receiver<()>,
    ) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let manager = self.clone();
        let shutdown = shutdown.resubscribe();
        let handle = tokio::spawn(async move {
            manager.leader_loop(stop_rx, shutdown).await;
        });
        (stop_tx, handle)
    }

    async fn leader_loop(
        self: Arc<Self>,
        mut stop: oneshot::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        self.set_state(LeadershipState::Establishing);

        let payload = self.config.node_name.clone().into_bytes();
        if let Err(e) = self.lan.user_event(NEW_LEADER_EVENT, payload, false).await {
            tracing::warn!(error = %e, "Failed to broadcast new leader event");
        }

        let mut reconcile_rx = self.reconcile_rx.lock().await;
        let tombstone_rx = self.tombstones.expire_receiver();
        let mut tombstone_rx = tombstone_rx.lock().await;
        let mut established = false;

        'reconcile: loop {
            let interval = tokio::time::sleep(self.config.reconcile_interval);
            tokio::pin!(interval);

            let reconciled = self.leader_pass(&mut established).await;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop => break 'reconcile,
                    _ = shutdown.recv() => break 'reconcile,
                    _ = &mut interval => continue 'reconcile,
                    Some(event) = reconcile_rx.recv(), if reconciled => {
                        // Errors are logged by the reconciler.
                        let _ = self.reconciler.reconcile_member(&event).await;
                    }
                    Some(index) = tombstone_rx.recv() => {
                        let consensus = self.consensus.clone();
                        tokio::spawn(async move {
                            reap_tombstones(consensus.as_ref(), index).await;
                        });
                    }
                }
            }
        }

        self.revoke_leadership().await;
    }

    /// Barrier, establish once, reconcile. Returns true when the full
    /// reconcile succeeded.
    async fn leader_pass(&self, established: &mut bool) -> bool {
        let started = Instant::now();
        if let Err(e) = self.consensus.barrier(self.config.barrier_write_timeout).await {
            tracing::error!(error = %e, "Failed to wait for barrier");
            return false;
        }
        metrics::record_leader_operation("barrier", started.elapsed().as_secs_f64());

        if !*established {
            if let Err(e) = self.establish_leadership().await {
                tracing::error!(error = %e, "Failed to establish leadership");
                self.revoke_leadership().await;
                // Still the raft leader; the next pass retries.
                self.set_state(LeadershipState::Establishing);
                return false;
            }
            *established = true;
        }

        match self.reconciler.reconcile().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reconcile");
                false
            }
        }
    }

    /// Start every leader-only duty. Safe to call again after a failure.
    pub async fn establish_leadership(&self) -> Result<()> {
        let started = Instant::now();
        self.initialize_acl().await?;

        self.tombstones.set_enabled(true);
        self.tombstones.hint(self.consensus.last_index());

        self.sessions.initialize()?;

        if let Err(e) = self.autopilot.get_or_create_config().await {
            tracing::warn!(error = %e, "Autopilot configuration not initialized");
        }
        self.autopilot.start().await;

        self.set_state(LeadershipState::Leading);
        metrics::record_leader_operation("establish", started.elapsed().as_secs_f64());
        tracing::info!(node = %self.config.node_name, "Leadership established");
        Ok(())
    }

    /// Stop every leader-only duty. Safe when establishment never completed.
    pub async fn revoke_leadership(&self) {
        self.tombstones.set_enabled(false);
        self.sessions.clear_all();
        self.autopilot.stop().await;
        self.set_state(LeadershipState::NotLeader);
        tracing::info!(node = %self.config.node_name, "Leadership revoked");
    }

    /// In the ACL datacenter: purge the authoritative cache and create the
    /// anonymous and master tokens if they are missing.
    async fn initialize_acl(&self) -> Result<()> {
        if !self.config.is_acl_authoritative() {
            return Ok(());
        }
        self.resolver.purge_authoritative();

        let state = self.consensus.state();
        let (_, anonymous) = state.acl_get(None, ANONYMOUS_TOKEN)?;
        if anonymous.is_none() {
            self.create_token(ANONYMOUS_TOKEN, "Anonymous Token", AclTokenType::Client)
                .await
                .map_err(|e| Error::Consensus(format!("failed to create anonymous token: {e}")))?;
            tracing::info!("Created ACL anonymous token");
        }

        if let Some(master) = self.config.acl_master_token.as_deref().filter(|t| !t.is_empty()) {
            let (_, existing) = state.acl_get(None, master)?;
            if existing.is_none() {
                self.create_token(master, "Master Token", AclTokenType::Management)
                    .await
                    .map_err(|e| Error::Consensus(format!("failed to create master token: {e}")))?;
                tracing::info!("Created ACL master token from configuration");
            }
        }
        Ok(())
    }

    async fn create_token(&self, id: &str, name: &str, kind: AclTokenType) -> Result<()> {
        let command = Command::AclSet(AclToken {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            rules: String::new(),
            modify_index: 0,
        });
        let result = self.consensus.apply(command).await;
        metrics::record_catalog_write("acl_set", result.is_ok());
        result.map(|_| ())
    }
}

async fn reap_tombstones(consensus: &dyn Consensus, index: u64) {
    let result = consensus.apply(Command::TombstoneReap { index }).await;
    metrics::record_tombstone_reap(result.is_ok());
    match result {
        Ok(_) => tracing::debug!(index, "Reaped tombstones"),
        Err(e) => tracing::error!(index, error = %e, "Failed to reap tombstones"),
    }
}
