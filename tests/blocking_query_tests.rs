//! Integration tests for blocking queries.
//!
//! Queries run against the in-memory state store; writes from a separate
//! task wake them through the store's watch channels.

use std::sync::Arc;
use std::time::{Duration, Instant};

use consulate::cluster::blocking::blocking_query;
use consulate::cluster::mock::MockConsensus;
use consulate::cluster::types::{QueryMeta, QueryOptions};
use consulate::cluster::Error;

fn blocking(min_index: u64, wait: Duration) -> QueryOptions {
    QueryOptions {
        min_query_index: min_index,
        max_query_time: wait,
        ..QueryOptions::default()
    }
}

// ============================================================================
// Return Conditions
// ============================================================================

#[tokio::test]
async fn test_non_blocking_query_returns_immediately() {
    let consensus = Arc::new(MockConsensus::new());
    consensus.store().register_node("n1", "10.0.0.1", None);

    let mut meta = QueryMeta::default();
    let nodes = blocking_query(consensus.as_ref(), &QueryOptions::default(), &mut meta, |ws, state| {
        state.nodes(Some(ws))
    })
    .await
    .unwrap();

    assert_eq!(nodes.len(), 1);
    assert_eq!(meta.index, 1);
}

#[tokio::test]
async fn test_returns_when_index_already_past_minimum() {
    let consensus = Arc::new(MockConsensus::new());
    consensus.store().register_node("n1", "10.0.0.1", None);
    consensus.store().register_node("n2", "10.0.0.2", None);

    let started = Instant::now();
    let mut meta = QueryMeta::default();
    let nodes = blocking_query(
        consensus.as_ref(),
        &blocking(1, Duration::from_secs(10)),
        &mut meta,
        |ws, state| state.nodes(Some(ws)),
    )
    .await
    .unwrap();

    assert_eq!(nodes.len(), 2);
    assert_eq!(meta.index, 2);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_write_wakes_blocked_query() {
    let consensus = Arc::new(MockConsensus::new());
    let index = consensus.store().register_node("n1", "10.0.0.1", None);

    let writer = consensus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.store().register_node("n2", "10.0.0.2", None);
    });

    let mut meta = QueryMeta::default();
    let nodes = blocking_query(
        consensus.as_ref(),
        &blocking(index, Duration::from_secs(10)),
        &mut meta,
        |ws, state| state.nodes(Some(ws)),
    )
    .await
    .unwrap();

    assert_eq!(nodes.len(), 2);
    assert!(meta.index > index);
}

#[tokio::test]
async fn test_write_to_other_table_does_not_return_early() {
    let consensus = Arc::new(MockConsensus::new());
    let index = consensus.store().register_node("n1", "10.0.0.1", None);

    let writer = consensus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.store().insert_session(consulate::cluster::types::Session {
            id: "s1".to_string(),
            node: "n1".to_string(),
            name: String::new(),
            ttl: None,
            create_index: 0,
        });
    });

    let started = Instant::now();
    let mut meta = QueryMeta::default();
    blocking_query(
        consensus.as_ref(),
        &blocking(index, Duration::from_millis(150)),
        &mut meta,
        |ws, state| state.nodes(Some(ws)),
    )
    .await
    .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(meta.index, index);
}

#[tokio::test]
async fn test_timeout_returns_unchanged_result() {
    let consensus = Arc::new(MockConsensus::new());
    let index = consensus.store().register_node("n1", "10.0.0.1", None);

    let started = Instant::now();
    let mut meta = QueryMeta::default();
    let nodes = blocking_query(
        consensus.as_ref(),
        &blocking(index, Duration::from_millis(80)),
        &mut meta,
        |ws, state| state.nodes(Some(ws)),
    )
    .await
    .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(80));
    assert_eq!(nodes.len(), 1);
    assert_eq!(meta.index, index);
}

#[tokio::test]
async fn test_restore_reruns_against_new_store() {
    let consensus = Arc::new(MockConsensus::new());
    consensus.store().register_node("old", "10.0.0.1", None);
    consensus.store().register_node("old-2", "10.0.0.2", None);

    let restorer = consensus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = restorer.restore();
        tokio::time::sleep(Duration::from_millis(30)).await;
        for i in 0..3 {
            fresh.register_node(&format!("new-{i}"), "10.0.1.1", None);
        }
    });

    let mut runs = 0;
    let mut meta = QueryMeta::default();
    let nodes = blocking_query(
        consensus.as_ref(),
        &blocking(2, Duration::from_secs(10)),
        &mut meta,
        |ws, state| {
            runs += 1;
            state.nodes(Some(ws))
        },
    )
    .await
    .unwrap();

    assert!(runs >= 3, "expected a rerun after restore and after the write, got {runs}");
    assert_eq!(meta.index, 3);
    assert!(nodes.iter().all(|n| n.node.starts_with("new-")));
}

#[tokio::test]
async fn test_query_error_propagates() {
    let consensus = Arc::new(MockConsensus::new());
    let mut meta = QueryMeta::default();
    let result: Result<(), Error> = blocking_query(
        consensus.as_ref(),
        &blocking(5, Duration::from_secs(10)),
        &mut meta,
        |_, _| Err(Error::Store("corrupt table".to_string())),
    )
    .await;
    assert_eq!(result.unwrap_err(), Error::Store("corrupt table".to_string()));
}

// ============================================================================
// Consistency and Metadata
// ============================================================================

#[tokio::test]
async fn test_consistent_read_requires_leadership() {
    let consensus = Arc::new(MockConsensus::new());
    let opts = QueryOptions {
        require_consistent: true,
        ..QueryOptions::default()
    };

    let mut meta = QueryMeta::default();
    let err = blocking_query(consensus.as_ref(), &opts, &mut meta, |ws, state| {
        state.nodes(Some(ws))
    })
    .await
    .unwrap_err();
    assert!(err.is_no_leader());

    consensus.set_leader(true);
    blocking_query(consensus.as_ref(), &opts, &mut meta, |ws, state| {
        state.nodes(Some(ws))
    })
    .await
    .unwrap();
    assert_eq!(consensus.verify_leader_calls(), 2);
}

#[tokio::test]
async fn test_meta_reports_follower_view() {
    let consensus = Arc::new(MockConsensus::new());
    consensus.set_leader_addr(Some("10.0.0.9:8300"));
    consensus.set_last_contact(Duration::from_millis(40));

    let mut meta = QueryMeta::default();
    blocking_query(consensus.as_ref(), &QueryOptions::default(), &mut meta, |ws, state| {
        state.nodes(Some(ws))
    })
    .await
    .unwrap();

    assert!(meta.known_leader);
    assert_eq!(meta.last_contact, Duration::from_millis(40));
}

#[tokio::test]
async fn test_meta_reports_leader_view() {
    let consensus = Arc::new(MockConsensus::new());
    consensus.set_leader(true);
    consensus.set_last_contact(Duration::from_millis(40));

    let mut meta = QueryMeta::default();
    blocking_query(consensus.as_ref(), &QueryOptions::default(), &mut meta, |ws, state| {
        state.nodes(Some(ws))
    })
    .await
    .unwrap();

    assert!(meta.known_leader);
    assert_eq!(meta.last_contact, Duration::ZERO);
}
