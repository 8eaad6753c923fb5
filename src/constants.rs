//! Centralized coordination constants.
//!
//! This module consolidates the well-known identifiers and limits shared by
//! the leader, reconciler, ACL resolver and blocking query engine.
//!
//! # Categories
//!
//! - **Catalog Constants**: identifiers the leader writes into the catalog
//! - **ACL Constants**: reserved token ids and cache sizing
//! - **Query Constants**: blocking query wait limits
//! - **Timer Constants**: session and retry timings

use std::time::Duration;

// =============================================================================
// Catalog Constants
// =============================================================================

/// Check id of the gossip health check maintained for every member.
pub const SERF_CHECK_ID: &str = "serfHealth";

/// Display name of the gossip health check.
pub const SERF_CHECK_NAME: &str = "Serf Health Status";

/// Output written when a member is alive.
pub const SERF_CHECK_ALIVE_OUTPUT: &str = "Agent alive and reachable";

/// Output written when a member is failed.
pub const SERF_CHECK_FAILED_OUTPUT: &str = "Agent not live or unreachable";

/// Service id and name registered for every server node.
pub const SERVER_SERVICE_ID: &str = "consul";

/// Service name registered for every server node.
pub const SERVER_SERVICE_NAME: &str = "consul";

/// Gossip tag value identifying a server member.
pub const SERVER_ROLE_TAG: &str = "consul";

/// Name of the user event broadcast when a new leader takes over.
pub const NEW_LEADER_EVENT: &str = "consul:new-leader";

// =============================================================================
// ACL Constants
// =============================================================================

/// Token id used when a request carries no token.
pub const ANONYMOUS_TOKEN: &str = "anonymous";

/// Replacement for token ids hidden from callers without ACL list rights.
pub const REDACTED_TOKEN: &str = "<hidden>";

/// Maximum number of token entries and compiled policies kept in memory.
pub const ACL_CACHE_SIZE: u64 = 10 * 1024;

/// Parent name of the built-in policy allowing everything except ACL management.
pub const ROOT_POLICY_ALLOW: &str = "allow";

/// Parent name of the built-in policy denying everything.
pub const ROOT_POLICY_DENY: &str = "deny";

/// Parent name of the built-in policy allowing everything.
pub const ROOT_POLICY_MANAGE: &str = "manage";

// =============================================================================
// Query Constants
// =============================================================================

/// Hard ceiling on how long a blocking query may wait.
pub const MAX_QUERY_TIME: Duration = Duration::from_secs(600);

/// Wait used when a blocking query does not ask for one.
pub const DEFAULT_QUERY_TIME: Duration = Duration::from_secs(300);

/// Blocking query waits get up to `wait / JITTER_FRACTION` of random extra time.
pub const JITTER_FRACTION: u32 = 16;

// =============================================================================
// Timer Constants
// =============================================================================

/// Session TTLs are multiplied by this before the session is invalidated.
pub const SESSION_TTL_MULTIPLIER: u32 = 2;

/// Capacity of the queue feeding member events to the leader loop.
pub const RECONCILE_CHANNEL_SIZE: usize = 256;

/// Minimum raft protocol version for non-voter promotion and health reporting.
pub const MIN_AUTOPILOT_RAFT_PROTOCOL: u32 = 3;
