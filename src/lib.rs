//! # Consulate
//! Server-side coordination core for a multi-datacenter service-discovery
//! platform.
//!
//! The crate sits between a replicated consensus log, LAN and WAN gossip
//! pools and an RPC transport, all provided by the embedding server, and
//! runs the duties that keep a cluster of servers coherent:
//!
//! - leader establishment and revocation, with periodic catalog reconciliation
//! - ACL token resolution with TTL caching and outage fallback policies
//! - autopilot: dead server cleanup, non-voter promotion and cluster health
//! - blocking (long-poll) queries over a versioned state store
//! - request forwarding to the leader or to another datacenter
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use consulate::prelude::*;
//!
//! # async fn run(deps: ServerDeps) -> Result<()> {
//! consulate::telemetry::init_logging(consulate::telemetry::LogFormat::from_env())
//!     .map_err(|e| Error::Config(e.to_string()))?;
//! let config = ServerConfig::from_env().map_err(|e| Error::Config(e.to_string()))?;
//! let server = Server::new(config, deps)?;
//!
//! let (_lan_tx, lan_rx) = tokio::sync::mpsc::channel(256);
//! server.start(lan_rx, None).await;
//!
//! // ... serve requests ...
//!
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! In-memory doubles for every collaborator are available under
//! `cluster::mock` with the `test-utilities` feature.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod constants;
pub mod telemetry;

pub use cluster::{Error, Result};

pub mod prelude {
    //! Main exports for embedding the coordination core.
    pub use crate::cluster::{
        AclDefaultPolicy, AclDownPolicy, Consensus, Error, GossipEvent, Gossip, LeadershipState,
        Member, MemberStatus, Result, RpcTransport, Server, ServerConfig, ServerDeps, StateStore,
    };
}
