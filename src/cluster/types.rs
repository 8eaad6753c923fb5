//! Shapes exchanged with the consensus log, the state store and the endpoint layer.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Catalog
// =============================================================================

/// A catalog node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Node {
    pub id: String,
    pub node: String,
    pub address: String,
    pub datacenter: String,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub modify_index: u64,
}

/// A service instance registered on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeService {
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub modify_index: u64,
}

/// Health check state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

/// A health check registered on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub node: String,
    pub check_id: String,
    pub name: String,
    pub status: HealthStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub modify_index: u64,
}

/// A service instance joined with its node, as returned by service lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub node: String,
    pub address: String,
    pub service_id: String,
    pub service_name: String,
    pub service_port: u16,
}

/// A node with all of its services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeServices {
    pub node: Node,
    pub services: BTreeMap<String, NodeService>,
}

/// A service instance with its node and checks, as returned by health lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: NodeService,
    pub checks: Vec<HealthCheck>,
}

/// A session bound to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub node: String,
    #[serde(default)]
    pub name: String,
    /// Sessions without a TTL never expire on their own.
    #[serde(default)]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub create_index: u64,
}

/// ACL token type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclTokenType {
    Client,
    Management,
}

/// An ACL token as stored in the authoritative datacenter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclToken {
    pub id: String,
    pub name: String,
    pub kind: AclTokenType,
    /// Rule text compiled on top of the datacenter's default policy.
    #[serde(default)]
    pub rules: String,
    #[serde(default)]
    pub modify_index: u64,
}

/// Autopilot settings, a singleton in the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutopilotConfig {
    /// Remove dead servers once a replacement joins.
    pub cleanup_dead_servers: bool,
    /// Servers that have not contacted the leader within this are unhealthy.
    pub last_contact_threshold: Duration,
    /// Servers lagging the leader by more log entries than this are unhealthy.
    pub max_trailing_logs: u64,
    /// How long a non-voter must stay healthy before promotion.
    pub server_stabilization_time: Duration,
    /// Gossip tag grouping servers into redundancy zones.
    #[serde(default)]
    pub redundancy_zone_tag: String,
    #[serde(default)]
    pub disable_upgrade_migration: bool,
    /// Gossip tag overriding the build version used for upgrade migration.
    #[serde(default)]
    pub upgrade_version_tag: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            cleanup_dead_servers: true,
            last_contact_threshold: Duration::from_millis(200),
            max_trailing_logs: 250,
            server_stabilization_time: Duration::from_secs(10),
            redundancy_zone_tag: String::new(),
            disable_upgrade_migration: false,
            upgrade_version_tag: String::new(),
            create_index: 0,
            modify_index: 0,
        }
    }
}

// =============================================================================
// Consensus
// =============================================================================

/// Voting role of a consensus member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suffrage {
    Voter,
    Nonvoter,
    Staging,
}

/// A member of the consensus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftServer {
    pub id: String,
    pub address: String,
    pub suffrage: Suffrage,
}

impl RaftServer {
    /// Servers added by the legacy address-based join carry their address as id.
    pub fn is_legacy(&self) -> bool {
        self.id == self.address
    }

    /// Voters and servers being staged to become voters.
    pub fn is_potential_voter(&self) -> bool {
        matches!(self.suffrage, Suffrage::Voter | Suffrage::Staging)
    }
}

/// Number of voters in a consensus configuration.
pub fn num_voters(servers: &[RaftServer]) -> usize {
    servers
        .iter()
        .filter(|s| s.suffrage == Suffrage::Voter)
        .count()
}

/// Catalog registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub datacenter: String,
    pub node: String,
    pub id: String,
    pub address: String,
    pub service: Option<NodeService>,
    pub check: Option<HealthCheck>,
    /// Leave the node entry untouched if it already exists.
    pub skip_node_update: bool,
}

/// Catalog deregistration of a whole node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub datacenter: String,
    pub node: String,
}

/// Writes funnelled through the consensus log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Register(RegisterRequest),
    Deregister(DeregisterRequest),
    SessionDestroy { id: String },
    AclSet(AclToken),
    AutopilotSetConfig { config: AutopilotConfig, cas: bool },
    TombstoneReap { index: u64 },
}

impl Command {
    /// Label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Register(_) => "register",
            Command::Deregister(_) => "deregister",
            Command::SessionDestroy { .. } => "session_destroy",
            Command::AclSet(_) => "acl_set",
            Command::AutopilotSetConfig { .. } => "autopilot_set_config",
            Command::TombstoneReap { .. } => "tombstone_reap",
        }
    }
}

/// Outcome of applying a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyResponse {
    /// Log index the command was committed at.
    pub index: u64,
    /// False when a check-and-set write lost its race.
    pub success: bool,
}

/// Raft statistics reported by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerStats {
    /// Time since the server last heard from the leader; `None` if never.
    pub last_contact: Option<Duration>,
    pub last_term: u64,
    pub last_index: u64,
}

// =============================================================================
// Reads
// =============================================================================

/// Options attached to every read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub token: String,
    /// Block until the result index exceeds this. Zero never blocks.
    pub min_query_index: u64,
    /// Requested wait. Zero selects the default.
    pub max_query_time: Duration,
    pub allow_stale: bool,
    pub require_consistent: bool,
}

/// Metadata attached to every read reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMeta {
    pub index: u64,
    pub last_contact: Duration,
    pub known_leader: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str, address: &str, suffrage: Suffrage) -> RaftServer {
        RaftServer {
            id: id.to_string(),
            address: address.to_string(),
            suffrage,
        }
    }

    #[test]
    fn test_num_voters_ignores_nonvoters() {
        let servers = vec![
            server("a", "10.0.0.1:8300", Suffrage::Voter),
            server("b", "10.0.0.2:8300", Suffrage::Nonvoter),
            server("c", "10.0.0.3:8300", Suffrage::Staging),
            server("d", "10.0.0.4:8300", Suffrage::Voter),
        ];
        assert_eq!(num_voters(&servers), 2);
    }

    #[test]
    fn test_legacy_server_detection() {
        assert!(server("10.0.0.1:8300", "10.0.0.1:8300", Suffrage::Voter).is_legacy());
        assert!(!server("node-1", "10.0.0.1:8300", Suffrage::Voter).is_legacy());
    }

    #[test]
    fn test_autopilot_defaults() {
        let config = AutopilotConfig::default();
        assert!(config.cleanup_dead_servers);
        assert_eq!(config.last_contact_threshold, Duration::from_millis(200));
        assert_eq!(config.max_trailing_logs, 250);
        assert_eq!(config.server_stabilization_time, Duration::from_secs(10));
    }

    #[test]
    fn test_server_stats_roundtrip_never_contacted() {
        let stats = ServerStats {
            last_contact: None,
            last_term: 4,
            last_index: 99,
        };
        let value = serde_json::to_value(&stats).unwrap();
        let back: ServerStats = serde_json::from_value(value).unwrap();
        assert_eq!(back.last_contact, None);
        assert_eq!(back.last_index, 99);
    }
}
