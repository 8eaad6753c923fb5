//! Operator entry points for autopilot.

use std::sync::Arc;

use super::acl::AclResolver;
use super::autopilot::{Autopilot, ClusterHealth};
use super::config::ServerConfig;
use super::error::{Error, Result};
use super::membership::{min_raft_protocol, parse_members};
use super::traits::{Consensus, Gossip};
use super::types::{AutopilotConfig, Command};
use crate::constants::MIN_AUTOPILOT_RAFT_PROTOCOL;

pub struct Operator {
    config: Arc<ServerConfig>,
    consensus: Arc<dyn Consensus>,
    lan: Arc<dyn Gossip>,
    resolver: Arc<AclResolver>,
    autopilot: Arc<Autopilot>,
}

impl Operator {
    pub fn new(
        config: Arc<ServerConfig>,
        consensus: Arc<dyn Consensus>,
        lan: Arc<dyn Gossip>,
        resolver: Arc<AclResolver>,
        autopilot: Arc<Autopilot>,
    ) -> Self {
        Self {
            config,
            consensus,
            lan,
            resolver,
            autopilot,
        }
    }

    async fn check_operator(&self, token: &str, write: bool) -> Result<()> {
        if let Some(policy) = self.resolver.resolve_token(token).await? {
            let allowed = if write {
                policy.operator_write()
            } else {
                policy.operator_read()
            };
            if !allowed {
                return Err(Error::PermissionDenied);
            }
        }
        Ok(())
    }

    /// Current autopilot configuration. Errors when none has been written.
    pub async fn autopilot_get_configuration(&self, token: &str) -> Result<AutopilotConfig> {
        self.check_operator(token, false).await?;
        let (_, config) = self.consensus.state().autopilot_config()?;
        config.ok_or_else(|| Error::Store("autopilot config not initialized yet".to_string()))
    }

    /// Write the autopilot configuration. With `cas`, the write only succeeds
    /// if `config.modify_index` matches the stored one; the return value says
    /// whether it did.
    pub async fn autopilot_set_configuration(
        &self,
        token: &str,
        config: AutopilotConfig,
        cas: bool,
    ) -> Result<bool> {
        self.check_operator(token, true).await?;
        let response = self
            .consensus
            .apply(Command::AutopilotSetConfig { config, cas })
            .await?;
        if cas && !response.success {
            tracing::info!("Autopilot configuration check-and-set failed");
        }
        Ok(response.success)
    }

    /// Latest cluster health. Only the leader tracks health, and only once
    /// every server speaks raft protocol 3.
    pub async fn server_health(&self, token: &str) -> Result<ClusterHealth> {
        self.check_operator(token, false).await?;
        if !self.consensus.is_leader() {
            return Err(Error::NoLeader);
        }

        let members = parse_members(&self.lan.members());
        let min_raft = min_raft_protocol(&members, &self.config.datacenter)?;
        if min_raft < MIN_AUTOPILOT_RAFT_PROTOCOL {
            return Err(Error::Unsupported(format!(
                "all servers must have raft_protocol set to {MIN_AUTOPILOT_RAFT_PROTOCOL} in order to use this endpoint"
            )));
        }
        Ok(self.autopilot.cluster_health())
    }
}
