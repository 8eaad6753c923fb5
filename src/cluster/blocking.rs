//! Blocking queries.
//!
//! A read that carries a minimum index is held until the state it reads moves
//! past that index, the wait expires, or the state store is abandoned (e.g.
//! replaced by a snapshot restore). Each wakeup re-runs the query against the
//! current store.
//!
//! ```rust,no_run
//! # use consulate::cluster::{blocking::blocking_query, traits::Consensus};
//! # use consulate::cluster::types::{QueryMeta, QueryOptions};
//! # async fn example(consensus: &dyn Consensus) -> consulate::Result<()> {
//! let opts = QueryOptions { min_query_index: 42, ..Default::default() };
//! let mut meta = QueryMeta::default();
//! let nodes = blocking_query(consensus, &opts, &mut meta, |ws, state| {
//!     state.nodes(Some(ws))
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tokio::time::Instant;

use super::error::Result;
use super::metrics;
use super::traits::{Consensus, StateStore};
use super::types::{QueryMeta, QueryOptions};
use super::watch::WatchSet;
use crate::constants::{DEFAULT_QUERY_TIME, JITTER_FRACTION, MAX_QUERY_TIME};

/// Random extra wait in `[0, max]`.
fn random_stagger(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=max_ms))
}

/// Effective wait for a requested max query time: clamped to the ceiling,
/// defaulted when zero, plus jitter of up to 1/16th.
pub fn query_wait(requested: Duration) -> Duration {
    let wait = if requested.is_zero() {
        DEFAULT_QUERY_TIME
    } else {
        requested.min(MAX_QUERY_TIME)
    };
    wait + random_stagger(wait / JITTER_FRACTION)
}

/// Fill in the leadership part of the reply metadata.
pub fn set_query_meta(consensus: &dyn Consensus, meta: &mut QueryMeta) {
    if consensus.is_leader() {
        meta.last_contact = Duration::ZERO;
        meta.known_leader = true;
    } else {
        meta.last_contact = consensus.last_contact();
        meta.known_leader = consensus.leader().is_some();
    }
}

/// Run `query` and hold the reply until its index exceeds
/// `opts.min_query_index`.
///
/// `query` returns the index of the data it read along with the result and
/// registers the tables it touched in the given watch set.
pub async fn blocking_query<T, F>(
    consensus: &dyn Consensus,
    opts: &QueryOptions,
    meta: &mut QueryMeta,
    mut query: F,
) -> Result<T>
where
    F: FnMut(&mut WatchSet, &dyn StateStore) -> Result<(u64, T)> + Send,
    T: Send,
{
    let deadline = (opts.min_query_index > 0)
        .then(|| Instant::now() + query_wait(opts.max_query_time));

    if opts.require_consistent {
        consensus.verify_leader().await?;
    }

    loop {
        set_query_meta(consensus, meta);

        let mut ws = WatchSet::new();
        let (index, value) = {
            let state = consensus.state();
            ws.add(state.abandon_handle());
            query(&mut ws, state.as_ref())?
        };
        meta.index = index;

        let Some(deadline) = deadline else {
            metrics::record_blocking_query("immediate");
            return Ok(value);
        };
        if index > opts.min_query_index {
            metrics::record_blocking_query("changed");
            return Ok(value);
        }
        if Instant::now() >= deadline {
            metrics::record_blocking_query("timeout");
            return Ok(value);
        }

        tokio::select! {
            _ = ws.wait() => {
                tracing::trace!(min_index = opts.min_query_index, "Blocking query woken");
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}
