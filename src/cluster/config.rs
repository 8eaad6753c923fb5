//! Server configuration.
//!
//! [`ServerConfig`] carries everything the coordination core reads at runtime:
//! node identity, ACL settings, loop intervals, forwarding and tombstone
//! timings, and the autopilot defaults written at first establishment.
//!
//! Parsing configuration files is left to the embedding agent. For simple
//! deployments [`ServerConfig::from_env`] reads the settings from environment
//! variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::types::AutopilotConfig;

/// Policy used for tokens without explicit rules, and for anonymous requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AclDefaultPolicy {
    #[default]
    Allow,
    Deny,
}

impl FromStr for AclDefaultPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(AclDefaultPolicy::Allow),
            "deny" => Ok(AclDefaultPolicy::Deny),
            other => Err(format!("unsupported ACL default policy: {other}")),
        }
    }
}

impl fmt::Display for AclDefaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclDefaultPolicy::Allow => f.write_str("allow"),
            AclDefaultPolicy::Deny => f.write_str("deny"),
        }
    }
}

/// Behavior when the authoritative ACL datacenter cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AclDownPolicy {
    Allow,
    Deny,
    #[default]
    ExtendCache,
}

impl FromStr for AclDownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(AclDownPolicy::Allow),
            "deny" => Ok(AclDownPolicy::Deny),
            "extend-cache" => Ok(AclDownPolicy::ExtendCache),
            other => Err(format!("unsupported ACL down policy: {other}")),
        }
    }
}

impl fmt::Display for AclDownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclDownPolicy::Allow => f.write_str("allow"),
            AclDownPolicy::Deny => f.write_str("deny"),
            AclDownPolicy::ExtendCache => f.write_str("extend-cache"),
        }
    }
}

/// Configuration of a server's coordination core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Gossip name of this node.
    pub node_name: String,
    /// Stable node id.
    pub node_id: String,
    /// Local datacenter.
    pub datacenter: String,

    /// Datacenter authoritative for ACLs. ACLs are disabled when unset.
    pub acl_datacenter: Option<String>,
    /// Management token created at first establishment in the ACL datacenter.
    pub acl_master_token: Option<String>,
    pub acl_default_policy: AclDefaultPolicy,
    pub acl_down_policy: AclDownPolicy,
    /// How long resolved tokens are cached outside the ACL datacenter.
    pub acl_ttl: Duration,
    /// Whether tokens are replicated locally, enabling the local fallback lookup.
    pub acl_replication: bool,
    /// Enforce node and session rules when filtering results.
    pub acl_enforce_version_8: bool,

    /// Interval between full reconciliations while leading.
    pub reconcile_interval: Duration,
    /// Bound on the barrier issued at the start of every leader pass.
    pub barrier_write_timeout: Duration,
    /// How long a request waits for a leader before failing.
    pub rpc_hold_timeout: Duration,

    /// Interval of the autopilot promote/prune loop.
    pub autopilot_interval: Duration,
    /// Interval of the autopilot health loop.
    pub server_health_interval: Duration,
    /// Autopilot settings written when none exist yet.
    pub autopilot: AutopilotConfig,

    /// How long deleted entries are kept as tombstones.
    pub tombstone_ttl: Duration,
    /// Tombstone expirations are batched into buckets of this width.
    pub tombstone_ttl_granularity: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_name: "server-1".to_string(),
            node_id: String::new(),
            datacenter: "dc1".to_string(),
            acl_datacenter: None,
            acl_master_token: None,
            acl_default_policy: AclDefaultPolicy::Allow,
            acl_down_policy: AclDownPolicy::ExtendCache,
            acl_ttl: Duration::from_secs(30),
            acl_replication: false,
            acl_enforce_version_8: true,
            reconcile_interval: Duration::from_secs(60),
            barrier_write_timeout: Duration::from_secs(120),
            rpc_hold_timeout: Duration::from_secs(7),
            autopilot_interval: Duration::from_secs(10),
            server_health_interval: Duration::from_secs(2),
            autopilot: AutopilotConfig::default(),
            tombstone_ttl: Duration::from_secs(15 * 60),
            tombstone_ttl_granularity: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// ACLs are enabled once an authoritative datacenter is configured.
    pub fn acl_enabled(&self) -> bool {
        self.acl_datacenter.as_deref().is_some_and(|dc| !dc.is_empty())
    }

    /// True when this server's datacenter is the ACL datacenter.
    pub fn is_acl_authoritative(&self) -> bool {
        self.acl_datacenter.as_deref() == Some(self.datacenter.as_str())
    }

    /// Validate the configuration.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node_name.is_empty() {
            errors.push("node_name must not be empty".to_string());
        }
        if self.datacenter.is_empty() {
            errors.push("datacenter must not be empty".to_string());
        }
        if self.datacenter.chars().any(|c| c.is_ascii_uppercase()) {
            errors.push(format!(
                "datacenter ({}) must be lowercase",
                self.datacenter
            ));
        }

        if self.acl_master_token.is_some() && !self.is_acl_authoritative() {
            errors.push(
                "acl_master_token is only used in the ACL datacenter; set acl_datacenter to the local datacenter"
                    .to_string(),
            );
        }
        if self.acl_enabled() && self.acl_ttl.is_zero() {
            errors.push("acl_ttl must be greater than zero".to_string());
        }

        for (name, value) in [
            ("reconcile_interval", self.reconcile_interval),
            ("barrier_write_timeout", self.barrier_write_timeout),
            ("rpc_hold_timeout", self.rpc_hold_timeout),
            ("autopilot_interval", self.autopilot_interval),
            ("server_health_interval", self.server_health_interval),
            ("tombstone_ttl", self.tombstone_ttl),
            ("tombstone_ttl_granularity", self.tombstone_ttl_granularity),
        ] {
            if value.is_zero() {
                errors.push(format!("{name} must be greater than zero"));
            }
        }

        if self.autopilot.last_contact_threshold.is_zero() {
            errors.push("autopilot last_contact_threshold must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and panic with a readable report on failure.
    ///
    /// Intended for startup, where an invalid configuration is fatal.
    pub fn validate_or_panic(&self) {
        if let Err(errors) = self.validate() {
            eprintln!("=== Configuration Validation Failed ===");
            for (i, error) in errors.iter().enumerate() {
                eprintln!("  {}. {}", i + 1, error);
            }
            eprintln!("========================================");
            panic!("Invalid configuration - {} error(s) found", errors.len());
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NODE_NAME`: gossip node name (default: server-1)
    /// - `NODE_ID`: node id (default: empty)
    /// - `DATACENTER`: local datacenter (default: dc1)
    /// - `ACL_DATACENTER`: authoritative ACL datacenter (default: unset, ACLs off)
    /// - `ACL_MASTER_TOKEN`: management token to seed (default: unset)
    /// - `ACL_DEFAULT_POLICY`: allow | deny (default: allow)
    /// - `ACL_DOWN_POLICY`: allow | deny | extend-cache (default: extend-cache)
    /// - `ACL_TTL_SECS`: token cache TTL (default: 30)
    /// - `ACL_REPLICATION`: enable local token fallback (default: false)
    /// - `ACL_ENFORCE_VERSION_8`: enforce node/session rules (default: true)
    /// - `RECONCILE_INTERVAL_SECS` (default: 60)
    /// - `RPC_HOLD_TIMEOUT_MS` (default: 7000)
    /// - `AUTOPILOT_INTERVAL_SECS` (default: 10)
    /// - `SERVER_HEALTH_INTERVAL_MS` (default: 2000)
    /// - `AUTOPILOT_CLEANUP_DEAD_SERVERS` (default: true)
    /// - `AUTOPILOT_LAST_CONTACT_THRESHOLD_MS` (default: 200)
    /// - `AUTOPILOT_MAX_TRAILING_LOGS` (default: 250)
    /// - `AUTOPILOT_SERVER_STABILIZATION_SECS` (default: 10)
    /// - `TOMBSTONE_TTL_SECS` (default: 900)
    /// - `TOMBSTONE_TTL_GRANULARITY_SECS` (default: 30)
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let node_name = std::env::var("NODE_NAME").unwrap_or(defaults.node_name);
        if node_name.is_empty() {
            return Err("NODE_NAME must not be empty".into());
        }
        let node_id = std::env::var("NODE_ID").unwrap_or(defaults.node_id);
        let datacenter = std::env::var("DATACENTER")
            .map(|v| v.to_lowercase())
            .unwrap_or(defaults.datacenter);

        let acl_datacenter = std::env::var("ACL_DATACENTER")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| v.to_lowercase());
        let acl_master_token = std::env::var("ACL_MASTER_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());

        let acl_default_policy = match std::env::var("ACL_DEFAULT_POLICY") {
            Ok(v) => v
                .parse::<AclDefaultPolicy>()
                .map_err(|e| format!("Invalid ACL_DEFAULT_POLICY: {}", e))?,
            Err(_) => defaults.acl_default_policy,
        };
        let acl_down_policy = match std::env::var("ACL_DOWN_POLICY") {
            Ok(v) => v
                .parse::<AclDownPolicy>()
                .map_err(|e| format!("Invalid ACL_DOWN_POLICY: {}", e))?,
            Err(_) => defaults.acl_down_policy,
        };

        let acl_ttl = std::env::var("ACL_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.acl_ttl);

        let acl_replication = std::env::var("ACL_REPLICATION")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(defaults.acl_replication);

        let acl_enforce_version_8 = std::env::var("ACL_ENFORCE_VERSION_8")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(defaults.acl_enforce_version_8);

        let reconcile_interval = std::env::var("RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.reconcile_interval);

        let rpc_hold_timeout = std::env::var("RPC_HOLD_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.rpc_hold_timeout);

        let autopilot_interval = std::env::var("AUTOPILOT_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.autopilot_interval);

        let server_health_interval = std::env::var("SERVER_HEALTH_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.server_health_interval);

        let mut autopilot = defaults.autopilot;
        autopilot.cleanup_dead_servers = std::env::var("AUTOPILOT_CLEANUP_DEAD_SERVERS")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(autopilot.cleanup_dead_servers);
        autopilot.last_contact_threshold = std::env::var("AUTOPILOT_LAST_CONTACT_THRESHOLD_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(autopilot.last_contact_threshold);
        autopilot.max_trailing_logs = std::env::var("AUTOPILOT_MAX_TRAILING_LOGS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(autopilot.max_trailing_logs);
        autopilot.server_stabilization_time =
            std::env::var("AUTOPILOT_SERVER_STABILIZATION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(autopilot.server_stabilization_time);

        let tombstone_ttl = std::env::var("TOMBSTONE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.tombstone_ttl);

        let tombstone_ttl_granularity = std::env::var("TOMBSTONE_TTL_GRANULARITY_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.tombstone_ttl_granularity);

        Ok(Self {
            node_name,
            node_id,
            datacenter,
            acl_datacenter,
            acl_master_token,
            acl_default_policy,
            acl_down_policy,
            acl_ttl,
            acl_replication,
            acl_enforce_version_8,
            reconcile_interval,
            barrier_write_timeout: defaults.barrier_write_timeout,
            rpc_hold_timeout,
            autopilot_interval,
            server_health_interval,
            autopilot,
            tombstone_ttl,
            tombstone_ttl_granularity,
        })
    }
}
