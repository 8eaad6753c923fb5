//! Server coordination core.
//!
//! This module holds everything a server runs on top of its consensus log
//! and gossip pools:
//!
//! - **Leader lifecycle**: establishes and revokes leader-only duties
//! - **ACL resolution**: token to policy, with caching and outage fallback
//! - **Autopilot**: dead server cleanup, non-voter promotion, health tracking
//! - **Reconciler**: keeps the catalog in line with gossip membership
//! - **Blocking queries**: long-polling reads against the state store
//! - **Routing**: forwarding to the leader or another datacenter
//!
//! # Architecture
//!
//! ```text
//!            LAN gossip        WAN gossip
//!                │                 │
//!                ▼                 ▼
//!        ┌──────────────────────────────┐
//!        │       EventDispatcher        │
//!        └──┬──────────┬─────────────┬──┘
//!           │          │             │
//!   reconcile queue  ServerDirectory RouteTable
//!           │          │             │
//!           ▼          ▼             ▼
//!   ┌──────────────┐  ┌───────────────────┐
//!   │ LeaderManager│  │     Forwarder     │◄── AclResolver (remote fetch)
//!   └──┬───────────┘  └───────────────────┘
//!      │ establish / revoke
//!      ├── Reconciler ── Consensus.apply
//!      ├── Autopilot ── StatsFetcher ── RpcTransport
//!      ├── SessionTimers
//!      └── TombstoneGc
//! ```
//!
//! Consensus, gossip, storage and RPC are consumed through the traits in
//! [`traits`]; the crate never implements them itself.

pub mod acl;
pub mod autopilot;
pub mod background_tasks;
pub mod blocking;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod flood;
pub mod leader;
pub mod membership;
pub mod metrics;
pub mod operator;
pub mod reconcile;
pub mod retry;
pub mod router;
mod server;
pub mod session_timers;
pub mod stats_fetcher;
pub mod tombstone_gc;
pub mod traits;
pub mod types;
pub mod watch;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

pub use autopilot::{Autopilot, ClusterHealth, ServerHealth};
pub use background_tasks::{BackgroundTaskRegistry, TaskStatus};
pub use config::{AclDefaultPolicy, AclDownPolicy, ServerConfig};
pub use error::{Error, Result};
pub use events::GossipEvent;
pub use leader::LeadershipState;
pub use membership::{Member, MemberStatus, ServerDescriptor, ServerDirectory};
pub use router::{ForwardOutcome, RequestInfo, RouteTable};
pub use server::{Server, ServerDeps};
pub use traits::{Consensus, Gossip, RpcTransport, StateStore};
pub use watch::WatchSet;
