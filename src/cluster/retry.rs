//! Named retry policies built on the `backon` crate.
//!
//! All policies include jitter so that servers recovering from the same
//! event do not retry in lockstep.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `leader_wait_policy` | 25ms | 1s | 64 | Waiting for a leader before forwarding |
//! | `session_invalidate_policy` | 10ms | 1s | 5 | Destroying an expired session |
//!
//! The leader wait policy is stepped by hand because the forwarder also
//! bounds it by `rpc_hold_timeout`:
//!
//! ```rust,no_run
//! use backon::BackoffBuilder;
//! use consulate::cluster::retry;
//!
//! let mut backoff = retry::leader_wait_policy().build();
//! let first = backoff.next();
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Policy for waiting on a leader while a request is held.
///
/// The caller also bounds the total wait by its hold timeout, so the retry
/// count only needs to outlast that window.
pub fn leader_wait_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(25))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(64)
        .with_jitter()
}

/// Policy for invalidating an expired session.
///
/// Six attempts in total, doubling from 10ms.
pub fn session_invalidate_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(5)
        .with_jitter()
}

/// Execute an async operation with the session invalidation policy.
pub async fn with_session_invalidate_policy<F, Fut, T, E, C>(
    operation: F,
    condition: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation
        .retry(session_invalidate_policy())
        .when(condition)
        .await
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: u32) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_leader_wait_policy_delays_are_bounded() {
        let delays: Vec<Duration> = leader_wait_policy().build().take(20).collect();
        assert_eq!(delays.len(), 20);
        // Jitter adds at most one extra delay on top of the capped value.
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(2)));
    }

    #[test]
    fn test_session_invalidate_policy_attempts() {
        assert_eq!(session_invalidate_policy().build().count(), 5);
    }

    #[tokio::test]
    async fn test_session_invalidate_retries_until_success() {
        let attempts = AtomicU32::new(0);

        let result = with_session_invalidate_policy(
            || async {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
                } else {
                    Ok(7)
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_session_invalidate_gives_up_after_six_attempts() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), std::io::Error> = with_session_invalidate_policy(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_retry_respects_condition() {
        let attempts = AtomicU32::new(0);

        let result: Result<i32, std::io::Error> = with_session_invalidate_policy(
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))
            },
            |e| e.kind() != std::io::ErrorKind::PermissionDenied,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
