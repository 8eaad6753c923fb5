//! Compiled ACL policies.
//!
//! A [`Policy`] is either one of the built-in roots (`allow`, `deny`,
//! `manage`) or a table of prefix rules chained to a parent policy. Lookups
//! use the longest matching prefix in the rule table and defer to the parent
//! when no rule matches.
//!
//! Rule text is JSON with one optional table per resource kind:
//!
//! ```json
//! {
//!   "node":     { "": "read", "db-": "write" },
//!   "service":  { "web": "write" },
//!   "session":  { "": "read" },
//!   "key":      { "app/": "write" },
//!   "operator": "read"
//! }
//! ```
//!
//! Compiled policies are immutable and shared behind `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::cluster::error::{Error, Result};
use crate::constants::{ROOT_POLICY_ALLOW, ROOT_POLICY_DENY, ROOT_POLICY_MANAGE};

/// Access level granted by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Deny,
    Read,
    Write,
}

impl Access {
    fn allows_read(self) -> bool {
        matches!(self, Access::Read | Access::Write)
    }

    fn allows_write(self) -> bool {
        self == Access::Write
    }
}

/// Parsed rule text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRules {
    #[serde(default)]
    pub node: BTreeMap<String, Access>,
    #[serde(default)]
    pub service: BTreeMap<String, Access>,
    #[serde(default)]
    pub session: BTreeMap<String, Access>,
    #[serde(default)]
    pub key: BTreeMap<String, Access>,
    #[serde(default)]
    pub operator: Option<Access>,
}

impl PolicyRules {
    /// Parse rule text. Empty text is an empty rule set.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(text).map_err(|e| Error::PolicyParse(e.to_string()))
    }
}

/// Stable id of a rule text, used to build ETags.
pub fn rule_id(rules: &str) -> String {
    hex::encode(Sha256::digest(rules.as_bytes()))
}

/// ETag identifying a compiled policy: its parent plus the rule id.
pub fn make_etag(parent: &str, rule_id: &str) -> String {
    format!("{parent}:{rule_id}")
}

/// The kind of a built-in root policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// Everything except ACL management.
    Allow,
    Deny,
    /// Everything including ACL management.
    Manage,
}

impl RootKind {
    pub fn name(self) -> &'static str {
        match self {
            RootKind::Allow => ROOT_POLICY_ALLOW,
            RootKind::Deny => ROOT_POLICY_DENY,
            RootKind::Manage => ROOT_POLICY_MANAGE,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            ROOT_POLICY_ALLOW => Some(RootKind::Allow),
            ROOT_POLICY_DENY => Some(RootKind::Deny),
            ROOT_POLICY_MANAGE => Some(RootKind::Manage),
            _ => None,
        }
    }
}

/// A compiled policy.
#[derive(Debug)]
pub enum Policy {
    Root(RootKind),
    Rules {
        parent: Arc<Policy>,
        rules: PolicyRules,
    },
}

fn longest_prefix(table: &BTreeMap<String, Access>, name: &str) -> Option<Access> {
    table
        .iter()
        .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, access)| *access)
}

impl Policy {
    /// Compile rule text on top of a parent policy.
    pub fn compile(parent: Arc<Policy>, rules: &str) -> Result<Self> {
        Ok(Policy::Rules {
            parent,
            rules: PolicyRules::parse(rules)?,
        })
    }

    fn lookup(
        &self,
        pick: fn(&PolicyRules) -> &BTreeMap<String, Access>,
        name: &str,
        check: fn(Access) -> bool,
    ) -> bool {
        match self {
            Policy::Root(kind) => *kind != RootKind::Deny,
            Policy::Rules { parent, rules } => match longest_prefix(pick(rules), name) {
                Some(access) => check(access),
                None => parent.lookup(pick, name, check),
            },
        }
    }

    pub fn node_read(&self, name: &str) -> bool {
        self.lookup(|r| &r.node, name, Access::allows_read)
    }

    pub fn node_write(&self, name: &str) -> bool {
        self.lookup(|r| &r.node, name, Access::allows_write)
    }

    pub fn service_read(&self, name: &str) -> bool {
        self.lookup(|r| &r.service, name, Access::allows_read)
    }

    pub fn service_write(&self, name: &str) -> bool {
        self.lookup(|r| &r.service, name, Access::allows_write)
    }

    pub fn session_read(&self, node: &str) -> bool {
        self.lookup(|r| &r.session, node, Access::allows_read)
    }

    pub fn session_write(&self, node: &str) -> bool {
        self.lookup(|r| &r.session, node, Access::allows_write)
    }

    pub fn key_read(&self, key: &str) -> bool {
        self.lookup(|r| &r.key, key, Access::allows_read)
    }

    pub fn key_write(&self, key: &str) -> bool {
        self.lookup(|r| &r.key, key, Access::allows_write)
    }

    pub fn operator_read(&self) -> bool {
        match self {
            Policy::Root(kind) => *kind != RootKind::Deny,
            Policy::Rules { parent, rules } => match rules.operator {
                Some(access) => access.allows_read(),
                None => parent.operator_read(),
            },
        }
    }

    pub fn operator_write(&self) -> bool {
        match self {
            Policy::Root(kind) => *kind != RootKind::Deny,
            Policy::Rules { parent, rules } => match rules.operator {
                Some(access) => access.allows_write(),
                None => parent.operator_write(),
            },
        }
    }

    /// Listing tokens is reserved for management.
    pub fn acl_list(&self) -> bool {
        match self {
            Policy::Root(kind) => *kind == RootKind::Manage,
            Policy::Rules { parent, .. } => parent.acl_list(),
        }
    }

    pub fn acl_modify(&self) -> bool {
        self.acl_list()
    }
}
