//! Process-scoped context built once at startup.
//!
//! Holds the built-in root policies so every component shares the same
//! `Arc<Policy>` instances. Constructed by [`crate::cluster::Server::new`]
//! and handed to the components that need it.

use std::sync::Arc;

use super::acl::policy::{Policy, RootKind};
use super::config::AclDefaultPolicy;

#[derive(Debug)]
pub struct ProcessContext {
    allow_all: Arc<Policy>,
    deny_all: Arc<Policy>,
    manage_all: Arc<Policy>,
}

impl ProcessContext {
    pub fn new() -> Self {
        Self {
            allow_all: Arc::new(Policy::Root(RootKind::Allow)),
            deny_all: Arc::new(Policy::Root(RootKind::Deny)),
            manage_all: Arc::new(Policy::Root(RootKind::Manage)),
        }
    }

    pub fn allow_all(&self) -> Arc<Policy> {
        self.allow_all.clone()
    }

    pub fn deny_all(&self) -> Arc<Policy> {
        self.deny_all.clone()
    }

    pub fn manage_all(&self) -> Arc<Policy> {
        self.manage_all.clone()
    }

    /// The root policy with this name, if it is one.
    pub fn root_policy(&self, name: &str) -> Option<Arc<Policy>> {
        RootKind::from_name(name).map(|kind| match kind {
            RootKind::Allow => self.allow_all(),
            RootKind::Deny => self.deny_all(),
            RootKind::Manage => self.manage_all(),
        })
    }

    pub fn default_policy(&self, policy: AclDefaultPolicy) -> Arc<Policy> {
        match policy {
            AclDefaultPolicy::Allow => self.allow_all(),
            AclDefaultPolicy::Deny => self.deny_all(),
        }
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roots_are_shared() {
        let ctx = ProcessContext::new();
        assert!(Arc::ptr_eq(&ctx.root_policy("deny").unwrap(), &ctx.deny_all()));
        assert!(Arc::ptr_eq(&ctx.default_policy(AclDefaultPolicy::Allow), &ctx.allow_all()));
        assert!(ctx.root_policy("anonymous").is_none());
    }
}
