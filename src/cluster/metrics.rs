//! Prometheus metrics for the coordination core.
//!
//! Metrics cover:
//! - Leadership (state, barrier and reconcile latency)
//! - ACL resolution (cache hits, misses, down-policy fallbacks)
//! - Autopilot (cluster health, failure tolerance, membership actions)
//! - Request routing (forwards, blocking queries)
//! - Timers (session TTLs, tombstone reaps)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "consulate" prefix to avoid
//! name collisions with other libraries using the default Prometheus registry.
//! Registration errors are handled gracefully: if a metric fails to register,
//! an unregistered instance is returned instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for coordination metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("consulate".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Leadership metrics
// =============================================================================

define_gauge!(
    LEADERSHIP_STATE,
    "leadership_state",
    "Leadership state: 0=not leader, 1=establishing, 2=leading"
);
define_counter_vec!(
    LEADERSHIP_TRANSITIONS,
    "leadership_transitions_total",
    "Leadership acquisitions and losses",
    ["transition"]
);
define_histogram_vec!(
    LEADER_OPERATION_DURATION,
    "leader_operation_duration_seconds",
    "Duration of leader loop operations (barrier, establish, reconcile)",
    ["operation"],
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
);
define_counter_vec!(
    RECONCILE_MEMBERS,
    "reconcile_members_total",
    "Members reconciled by status and outcome",
    ["status", "outcome"]
);
define_counter_vec!(
    CATALOG_WRITES,
    "catalog_writes_total",
    "Commands applied through the consensus log by the leader",
    ["command", "status"]
);

// =============================================================================
// ACL metrics
// =============================================================================

define_counter_vec!(
    ACL_CACHE,
    "acl_cache_total",
    "ACL cache lookups by result (hit, miss, etag_refresh, replication_hit)",
    ["result"]
);
define_counter_vec!(
    ACL_DOWN_POLICY,
    "acl_down_policy_total",
    "Times the ACL down policy decided a resolution",
    ["policy"]
);

// =============================================================================
// Autopilot metrics
// =============================================================================

define_gauge!(
    AUTOPILOT_HEALTHY,
    "autopilot_healthy",
    "1 if every server is healthy, 0 otherwise"
);
define_gauge!(
    AUTOPILOT_FAILURE_TOLERANCE,
    "autopilot_failure_tolerance",
    "Number of voters that can fail without losing quorum"
);
define_counter_vec!(
    AUTOPILOT_ACTIONS,
    "autopilot_actions_total",
    "Membership changes made by autopilot",
    ["action", "status"]
);
define_counter_vec!(
    STATS_FETCH,
    "stats_fetch_total",
    "Server stats fetches by outcome",
    ["outcome"]
);

// =============================================================================
// Request metrics
// =============================================================================

define_counter_vec!(
    RPC_FORWARDS,
    "rpc_forwards_total",
    "Requests by routing decision and outcome",
    ["target", "status"]
);
define_counter_vec!(
    BLOCKING_QUERIES,
    "blocking_queries_total",
    "Blocking queries by how they completed",
    ["outcome"]
);

// =============================================================================
// Timer metrics
// =============================================================================

define_gauge!(
    SESSION_TIMERS,
    "session_timers",
    "Number of armed session TTL timers"
);
define_counter_vec!(
    SESSION_INVALIDATIONS,
    "session_invalidations_total",
    "Sessions invalidated by TTL expiry",
    ["status"]
);
define_counter_vec!(
    TOMBSTONE_REAPS,
    "tombstone_reaps_total",
    "Tombstone reap commands issued",
    ["status"]
);
define_counter!(
    FLOOD_NOTIFICATIONS,
    "flood_notifications_total",
    "Flood notifications sent to subscribers"
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);

// =============================================================================
// Safe registration
// =============================================================================

/// Register an IntGauge safely, returning a fallback on error.
fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounterVec safely, returning a fallback on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register an IntCounter safely, returning a fallback on error.
fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning a fallback on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Initialize the metrics registry by registering all metrics.
///
/// Idempotent. Metrics are otherwise registered lazily on first use.
pub fn init_metrics() {
    let _ = &*LEADERSHIP_STATE;
    let _ = &*LEADERSHIP_TRANSITIONS;
    let _ = &*LEADER_OPERATION_DURATION;
    let _ = &*RECONCILE_MEMBERS;
    let _ = &*CATALOG_WRITES;
    let _ = &*ACL_CACHE;
    let _ = &*ACL_DOWN_POLICY;
    let _ = &*AUTOPILOT_HEALTHY;
    let _ = &*AUTOPILOT_FAILURE_TOLERANCE;
    let _ = &*AUTOPILOT_ACTIONS;
    let _ = &*STATS_FETCH;
    let _ = &*RPC_FORWARDS;
    let _ = &*BLOCKING_QUERIES;
    let _ = &*SESSION_TIMERS;
    let _ = &*SESSION_INVALIDATIONS;
    let _ = &*TOMBSTONE_REAPS;
    let _ = &*FLOOD_NOTIFICATIONS;
    let _ = &*RETRY_ATTEMPTS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Gather all metric families from the registry.
pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

// =============================================================================
// Recording helpers
// =============================================================================

/// Record the leadership state (0=not leader, 1=establishing, 2=leading).
pub fn set_leadership_state(state: i64) {
    LEADERSHIP_STATE.set(state);
}

pub fn record_leadership_transition(transition: &str) {
    LEADERSHIP_TRANSITIONS.with_label_values(&[transition]).inc();
}

/// Record the duration of a leader loop operation.
pub fn record_leader_operation(operation: &str, duration_secs: f64) {
    LEADER_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

pub fn record_reconcile_member(status: &str, outcome: &str) {
    RECONCILE_MEMBERS.with_label_values(&[status, outcome]).inc();
}

pub fn record_catalog_write(command: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    CATALOG_WRITES.with_label_values(&[command, status]).inc();
}

/// Record an ACL cache lookup.
pub fn record_acl_cache(result: &str) {
    ACL_CACHE.with_label_values(&[result]).inc();
}

pub fn record_acl_down_policy(policy: &str) {
    ACL_DOWN_POLICY.with_label_values(&[policy]).inc();
}

/// Publish the latest cluster health snapshot.
pub fn set_autopilot_health(healthy: bool, failure_tolerance: usize) {
    AUTOPILOT_HEALTHY.set(i64::from(healthy));
    AUTOPILOT_FAILURE_TOLERANCE.set(failure_tolerance as i64);
}

pub fn record_autopilot_action(action: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    AUTOPILOT_ACTIONS.with_label_values(&[action, status]).inc();
}

pub fn record_stats_fetch(outcome: &str) {
    STATS_FETCH.with_label_values(&[outcome]).inc();
}

pub fn record_rpc_forward(target: &str, status: &str) {
    RPC_FORWARDS.with_label_values(&[target, status]).inc();
}

pub fn record_blocking_query(outcome: &str) {
    BLOCKING_QUERIES.with_label_values(&[outcome]).inc();
}

pub fn set_session_timers(count: usize) {
    SESSION_TIMERS.set(count as i64);
}

pub fn record_session_invalidation(success: bool) {
    let status = if success { "success" } else { "error" };
    SESSION_INVALIDATIONS.with_label_values(&[status]).inc();
}

pub fn record_tombstone_reap(success: bool) {
    let status = if success { "success" } else { "error" };
    TOMBSTONE_REAPS.with_label_values(&[status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
        let names: Vec<String> = gather_metrics()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "consulate_leadership_state"));
    }

    #[test]
    #[serial]
    fn test_acl_cache_counter() {
        let before = ACL_CACHE.with_label_values(&["hit"]).get();
        record_acl_cache("hit");
        assert_eq!(ACL_CACHE.with_label_values(&["hit"]).get(), before + 1);
    }

    #[test]
    #[serial]
    fn test_autopilot_health_gauges() {
        set_autopilot_health(true, 2);
        assert_eq!(AUTOPILOT_HEALTHY.get(), 1);
        assert_eq!(AUTOPILOT_FAILURE_TOLERANCE.get(), 2);
        set_autopilot_health(false, 0);
        assert_eq!(AUTOPILOT_HEALTHY.get(), 0);
    }

    #[test]
    #[serial]
    fn test_encode_metrics_contains_prefix() {
        record_rpc_forward("leader", "success");
        let text = encode_metrics().unwrap();
        assert!(text.contains("consulate_rpc_forwards_total"));
    }
}
