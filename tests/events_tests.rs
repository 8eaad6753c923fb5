//! Integration tests for gossip event dispatch.
//!
//! Covers the LAN server directory, flood notifications, the leader-only
//! reconcile queue and the WAN route table.

use std::sync::Arc;

use consulate::cluster::events::EventDispatcher;
use consulate::cluster::flood::FloodNotifier;
use consulate::cluster::mock::{MockConsensus, client_member, server_member};
use consulate::cluster::reconcile::{ReconcileEvent, ReconcileStatus};
use consulate::cluster::{
    GossipEvent, MemberStatus, RouteTable, ServerConfig, ServerDirectory,
};
use consulate::constants::NEW_LEADER_EVENT;
use tokio::sync::{broadcast, mpsc};

struct Harness {
    consensus: Arc<MockConsensus>,
    servers: Arc<ServerDirectory>,
    routes: Arc<RouteTable>,
    flood: Arc<FloodNotifier>,
    dispatcher: Arc<EventDispatcher>,
    reconcile_rx: mpsc::Receiver<ReconcileEvent>,
}

fn harness(queue: usize) -> Harness {
    let consensus = Arc::new(MockConsensus::new());
    let servers = Arc::new(ServerDirectory::new());
    let routes = Arc::new(RouteTable::new());
    let flood = Arc::new(FloodNotifier::new());
    let (tx, reconcile_rx) = mpsc::channel(queue);
    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::new(ServerConfig {
            node_name: "s1".to_string(),
            ..ServerConfig::default()
        }),
        consensus.clone(),
        servers.clone(),
        routes.clone(),
        flood.clone(),
        tx,
    ));
    Harness {
        consensus,
        servers,
        routes,
        flood,
        dispatcher,
        reconcile_rx,
    }
}

// ============================================================================
// LAN Events
// ============================================================================

#[tokio::test]
async fn test_lan_join_adds_local_servers_only() {
    let h = harness(8);
    h.dispatcher.handle_lan_event(&GossipEvent::MemberJoin(vec![
        server_member("s2", "10.0.0.2", "dc1", 3),
        server_member("x1", "10.9.0.1", "dc9", 3),
        client_member("c1", "10.0.0.5", "dc1"),
    ]));

    assert_eq!(h.servers.len(), 1);
    let s2 = h.servers.server_by_id("s2").unwrap();
    assert_eq!(s2.addr, "10.0.0.2:8300".parse().unwrap());
}

#[tokio::test]
async fn test_lan_leave_and_reap_remove_server() {
    let h = harness(8);
    let s2 = server_member("s2", "10.0.0.2", "dc1", 3);
    let s3 = server_member("s3", "10.0.0.3", "dc1", 3);
    h.dispatcher
        .handle_lan_event(&GossipEvent::MemberJoin(vec![s2.clone(), s3.clone()]));
    assert_eq!(h.servers.len(), 2);

    h.dispatcher.handle_lan_event(&GossipEvent::MemberFailed(vec![s2]));
    assert!(h.servers.server_by_id("s2").is_none());

    h.dispatcher.handle_lan_event(&GossipEvent::MemberReap(vec![s3]));
    assert!(h.servers.is_empty());
}

#[tokio::test]
async fn test_server_join_notifies_flood_subscribers() {
    let h = harness(8);
    let mut flood_rx = h.flood.subscribe();

    h.dispatcher
        .handle_lan_event(&GossipEvent::MemberJoin(vec![client_member("c1", "10.0.0.5", "dc1")]));
    assert!(flood_rx.try_recv().is_err());

    h.dispatcher.handle_lan_event(&GossipEvent::MemberJoin(vec![server_member(
        "s2", "10.0.0.2", "dc1", 3,
    )]));
    assert!(flood_rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_user_events_do_not_touch_membership() {
    let mut h = harness(8);
    h.consensus.set_leader(true);
    h.dispatcher.handle_lan_event(&GossipEvent::User {
        name: NEW_LEADER_EVENT.to_string(),
        payload: b"s2".to_vec(),
    });
    assert!(h.servers.is_empty());
    assert!(h.reconcile_rx.try_recv().is_err());
}

// ============================================================================
// Reconcile Queue
// ============================================================================

#[tokio::test]
async fn test_followers_do_not_queue_reconcile() {
    let mut h = harness(8);
    h.dispatcher
        .handle_lan_event(&GossipEvent::MemberJoin(vec![client_member("c1", "10.0.0.5", "dc1")]));
    assert!(h.reconcile_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_leader_queues_member_status() {
    let mut h = harness(8);
    h.consensus.set_leader(true);

    let mut c1 = client_member("c1", "10.0.0.5", "dc1");
    h.dispatcher
        .handle_lan_event(&GossipEvent::MemberJoin(vec![c1.clone()]));
    c1.status = MemberStatus::Failed;
    h.dispatcher
        .handle_lan_event(&GossipEvent::MemberFailed(vec![c1.clone()]));
    h.dispatcher.handle_lan_event(&GossipEvent::MemberReap(vec![c1]));

    let statuses: Vec<ReconcileStatus> = std::iter::from_fn(|| h.reconcile_rx.try_recv().ok())
        .map(|event| event.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ReconcileStatus::Alive,
            ReconcileStatus::Failed,
            ReconcileStatus::Reaped
        ]
    );
}

#[tokio::test]
async fn test_leaving_members_not_queued() {
    let mut h = harness(8);
    h.consensus.set_leader(true);
    let mut c1 = client_member("c1", "10.0.0.5", "dc1");
    c1.status = MemberStatus::Leaving;

    h.dispatcher.handle_lan_event(&GossipEvent::MemberUpdate(vec![c1]));
    assert!(h.reconcile_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_full_reconcile_queue_drops_events() {
    let mut h = harness(1);
    h.consensus.set_leader(true);
    h.dispatcher.handle_lan_event(&GossipEvent::MemberJoin(vec![
        client_member("c1", "10.0.0.5", "dc1"),
        client_member("c2", "10.0.0.6", "dc1"),
    ]));

    assert_eq!(h.reconcile_rx.try_recv().unwrap().member.name, "c1");
    assert!(h.reconcile_rx.try_recv().is_err());
}

// ============================================================================
// WAN Events
// ============================================================================

#[tokio::test]
async fn test_wan_routes_follow_membership() {
    let h = harness(8);
    let mut r1 = server_member("r1.dc2", "10.2.0.1", "dc2", 3);
    let r2 = server_member("r2.dc2", "10.2.0.2", "dc2", 3);
    h.dispatcher
        .handle_wan_event(&GossipEvent::MemberJoin(vec![r1.clone(), r2.clone()]));
    assert_eq!(h.routes.datacenters(), vec!["dc2"]);
    assert_eq!(h.routes.find_route("dc2").unwrap().name, "r1.dc2");

    r1.status = MemberStatus::Failed;
    h.dispatcher.handle_wan_event(&GossipEvent::MemberFailed(vec![r1.clone()]));
    assert_eq!(h.routes.find_route("dc2").unwrap().name, "r2.dc2");

    h.dispatcher
        .handle_wan_event(&GossipEvent::MemberLeave(vec![r1, r2]));
    assert!(h.routes.datacenters().is_empty());
}

#[tokio::test]
async fn test_wan_clients_ignored() {
    let h = harness(8);
    h.dispatcher
        .handle_wan_event(&GossipEvent::MemberJoin(vec![client_member("c1", "10.2.0.9", "dc2")]));
    assert!(h.routes.datacenters().is_empty());
}

#[tokio::test]
async fn test_dispatch_loops_stop_on_shutdown() {
    let h = harness(8);
    let (lan_tx, lan_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let handle = tokio::spawn(h.dispatcher.clone().run_lan(lan_rx, shutdown_rx));
    lan_tx
        .send(GossipEvent::MemberJoin(vec![server_member("s2", "10.0.0.2", "dc1", 3)]))
        .await
        .unwrap();

    for _ in 0..100 {
        if !h.servers.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(h.servers.len(), 1);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}
