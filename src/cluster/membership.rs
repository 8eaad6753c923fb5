//! Gossip members and the typed view of them used everywhere else.
//!
//! Gossip carries member metadata as a loosely typed tag map. [`ParsedMember::parse`]
//! is the one place those tags are read; downstream code only ever sees the
//! parsed [`ParsedMember`] and, for servers, its [`ServerDescriptor`].
//!
//! Recognised tags:
//!
//! | Tag | Meaning |
//! |-----|---------|
//! | `role` | `consul` for servers, `node` for clients |
//! | `dc` | datacenter |
//! | `id` | node id |
//! | `port` | server RPC port |
//! | `bootstrap` | present when the server runs in bootstrap mode |
//! | `expect` | bootstrap-expect count |
//! | `build` | build version |
//! | `raft_vsn` | raft protocol version (defaults to 1) |

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use crate::constants::SERVER_ROLE_TAG;

/// Gossip status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    None,
    Alive,
    Leaving,
    Left,
    Failed,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberStatus::None => "none",
            MemberStatus::Alive => "alive",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Left => "left",
            MemberStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A member as reported by the gossip layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
}

/// Identity of a server member, parsed from its tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub id: String,
    pub datacenter: String,
    /// RPC address: member IP plus the `port` tag.
    pub addr: SocketAddr,
    pub bootstrap: bool,
    pub expect: u32,
    pub build: String,
    pub raft_version: u32,
    pub status: MemberStatus,
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Addr: {}) (DC: {})", self.name, self.addr, self.datacenter)
    }
}

/// Role of a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRole {
    Server(ServerDescriptor),
    Client,
}

/// A gossip member with its tags parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMember {
    pub name: String,
    pub addr: IpAddr,
    pub node_id: String,
    pub datacenter: String,
    pub status: MemberStatus,
    pub role: MemberRole,
}

impl ParsedMember {
    /// Parse a gossip member. Servers with a missing or malformed `port` tag
    /// are treated as clients.
    pub fn parse(member: &Member) -> Self {
        let datacenter = member.tags.get("dc").cloned().unwrap_or_default();
        let node_id = member.tags.get("id").cloned().unwrap_or_default();

        let role = match member.tags.get("role").map(String::as_str) {
            Some(SERVER_ROLE_TAG) => match parse_server(member, &datacenter, &node_id) {
                Some(server) => MemberRole::Server(server),
                None => {
                    tracing::warn!(member = %member.name, "Server member has invalid port tag");
                    MemberRole::Client
                }
            },
            _ => MemberRole::Client,
        };

        Self {
            name: member.name.clone(),
            addr: member.addr,
            node_id,
            datacenter,
            status: member.status,
            role,
        }
    }

    /// Server identity, if this member is a server.
    pub fn server(&self) -> Option<&ServerDescriptor> {
        match &self.role {
            MemberRole::Server(server) => Some(server),
            MemberRole::Client => None,
        }
    }

    pub fn is_server(&self) -> bool {
        self.server().is_some()
    }
}

fn parse_server(member: &Member, datacenter: &str, node_id: &str) -> Option<ServerDescriptor> {
    let port: u16 = member.tags.get("port")?.parse().ok()?;
    let expect = member
        .tags
        .get("expect")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let raft_version = member
        .tags
        .get("raft_vsn")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    Some(ServerDescriptor {
        name: member.name.clone(),
        id: node_id.to_string(),
        datacenter: datacenter.to_string(),
        addr: SocketAddr::new(member.addr, port),
        bootstrap: member.tags.contains_key("bootstrap"),
        expect,
        build: member.tags.get("build").cloned().unwrap_or_default(),
        raft_version,
        status: member.status,
    })
}

/// Parse every member once.
pub fn parse_members(members: &[Member]) -> Vec<ParsedMember> {
    members.iter().map(ParsedMember::parse).collect()
}

/// Lowest raft protocol version among alive servers of a datacenter.
pub fn min_raft_protocol(members: &[ParsedMember], datacenter: &str) -> Result<u32> {
    members
        .iter()
        .filter(|m| m.status == MemberStatus::Alive)
        .filter_map(ParsedMember::server)
        .filter(|s| s.datacenter == datacenter)
        .map(|s| s.raft_version)
        .min()
        .ok_or(Error::NoServers)
}

/// Directory of the local datacenter's servers, indexed by RPC address and id.
///
/// Fed by LAN gossip events; consulted by the forwarder to map the consensus
/// leader address to a server.
#[derive(Debug, Default)]
pub struct ServerDirectory {
    by_addr: DashMap<SocketAddr, ServerDescriptor>,
    by_id: DashMap<String, SocketAddr>,
}

impl ServerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, server: ServerDescriptor) {
        if !server.id.is_empty() {
            self.by_id.insert(server.id.clone(), server.addr);
        }
        self.by_addr.insert(server.addr, server);
    }

    pub fn remove_server(&self, server: &ServerDescriptor) {
        self.by_addr.remove(&server.addr);
        self.by_id.remove_if(&server.id, |_, addr| *addr == server.addr);
    }

    pub fn server(&self, addr: &SocketAddr) -> Option<ServerDescriptor> {
        self.by_addr.get(addr).map(|s| s.clone())
    }

    pub fn server_by_id(&self, id: &str) -> Option<ServerDescriptor> {
        let addr = *self.by_id.get(id)?;
        self.server(&addr)
    }

    pub fn servers(&self) -> Vec<ServerDescriptor> {
        self.by_addr.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}
