//! ACL cache entries and the authoritative policy cache.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use moka::sync::Cache;

use super::policy::{Policy, make_etag, rule_id};
use crate::cluster::context::ProcessContext;
use crate::cluster::error::{Error, Result};

/// A token resolved outside the authoritative datacenter.
///
/// Shared by every caller resolving the same token. The expiry is the only
/// mutable part and is extended in place when a refresh returns the same ETag.
#[derive(Debug)]
pub struct AclCacheEntry {
    policy: Arc<Policy>,
    etag: String,
    expires: Mutex<Instant>,
}

impl AclCacheEntry {
    pub fn new(policy: Arc<Policy>, etag: String, ttl: Duration) -> Self {
        Self {
            policy,
            etag,
            expires: Mutex::new(Instant::now() + ttl),
        }
    }

    pub fn policy(&self) -> Arc<Policy> {
        self.policy.clone()
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn expires(&self) -> Instant {
        *self.expires.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires()
    }

    /// Push the expiry to `now + ttl`.
    pub fn extend(&self, ttl: Duration) {
        *self.expires.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now() + ttl;
    }
}

/// A token faulted in from a state store: its parent policy name and rule text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultedAcl {
    pub parent: String,
    pub rules: String,
}

impl FaultedAcl {
    pub fn etag(&self) -> String {
        make_etag(&self.parent, &rule_id(&self.rules))
    }
}

/// Looks a token up in a state store. Returns [`Error::AclNotFound`] for unknown ids.
pub type AclFaultFn = Arc<dyn Fn(&str) -> Result<FaultedAcl> + Send + Sync>;

#[derive(Debug)]
struct AuthoritativeEntry {
    acl: FaultedAcl,
    etag: String,
    policy: Arc<Policy>,
}

/// Policy cache of the authoritative datacenter's leader.
///
/// Every lookup reads the token from the local state store. The compiled
/// policy is reused while the token's ETag is unchanged, so a rule change
/// or deletion takes effect on the next resolution.
pub struct AuthoritativeCache {
    ctx: Arc<ProcessContext>,
    fault: AclFaultFn,
    tokens: Cache<String, Arc<AuthoritativeEntry>>,
    policies: Cache<String, Arc<Policy>>,
}

impl AuthoritativeCache {
    pub fn new(ctx: Arc<ProcessContext>, fault: AclFaultFn, capacity: u64) -> Self {
        Self {
            ctx,
            fault,
            tokens: Cache::new(capacity),
            policies: Cache::new(capacity),
        }
    }

    fn load(&self, id: &str) -> Result<Arc<AuthoritativeEntry>> {
        let acl = match (self.fault)(id) {
            Ok(acl) => acl,
            Err(e) => {
                if e.is_acl_not_found() {
                    self.tokens.invalidate(id);
                }
                return Err(e);
            }
        };
        let etag = acl.etag();
        if let Some(entry) = self.tokens.get(id)
            && entry.etag == etag
        {
            return Ok(entry);
        }

        let policy = match self.policies.get(&etag) {
            Some(policy) => policy,
            None => {
                let parent = self.ctx.root_policy(&acl.parent).ok_or_else(|| {
                    Error::PolicyParse(format!("unknown parent policy {:?}", acl.parent))
                })?;
                let policy = Arc::new(Policy::compile(parent, &acl.rules)?);
                self.policies.insert(etag.clone(), policy.clone());
                policy
            }
        };

        let entry = Arc::new(AuthoritativeEntry { acl, etag, policy });
        self.tokens.insert(id.to_string(), entry.clone());
        Ok(entry)
    }

    /// Compiled policy for a token.
    pub fn get_policy(&self, id: &str) -> Result<Arc<Policy>> {
        Ok(self.load(id)?.policy.clone())
    }

    /// Parent, rule text and ETag for a token, as served to other datacenters.
    pub fn get_acl_policy(&self, id: &str) -> Result<(FaultedAcl, String)> {
        let entry = self.load(id)?;
        Ok((entry.acl.clone(), entry.etag.clone()))
    }

    /// Drop the cached entry for one token.
    pub fn clear_acl(&self, id: &str) {
        self.tokens.invalidate(id);
    }

    pub fn purge(&self) {
        self.tokens.invalidate_all();
        self.policies.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_fault(calls: Arc<AtomicU32>) -> AclFaultFn {
        Arc::new(move |id: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            match id {
                "mgmt" => Ok(FaultedAcl {
                    parent: "manage".to_string(),
                    rules: String::new(),
                }),
                "client" => Ok(FaultedAcl {
                    parent: "deny".to_string(),
                    rules: r#"{"service": {"web": "read"}}"#.to_string(),
                }),
                _ => Err(Error::AclNotFound),
            }
        })
    }

    #[test]
    fn test_entry_extend() {
        let entry = AclCacheEntry::new(
            Arc::new(Policy::Root(super::super::policy::RootKind::Deny)),
            "deny:x".to_string(),
            Duration::ZERO,
        );
        assert!(entry.is_expired());
        entry.extend(Duration::from_secs(30));
        assert!(!entry.is_expired());
        assert!(entry.expires() > Instant::now() + Duration::from_secs(29));
    }

    #[test]
    fn test_authoritative_reuses_unchanged_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = AuthoritativeCache::new(
            Arc::new(ProcessContext::new()),
            counting_fault(calls.clone()),
            16,
        );

        let first = cache.get_policy("client").unwrap();
        let second = cache.get_policy("client").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(first.service_read("web"));
        assert!(!first.service_read("db"));

        cache.purge();
        let third = cache.get_policy("client").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_authoritative_follows_rule_changes() {
        let rules = Arc::new(Mutex::new(r#"{"service": {"web": "write"}}"#.to_string()));
        let current = rules.clone();
        let fault: AclFaultFn = Arc::new(move |id: &str| match id {
            "t1" => Ok(FaultedAcl {
                parent: "deny".to_string(),
                rules: current.lock().unwrap().clone(),
            }),
            _ => Err(Error::AclNotFound),
        });
        let cache = AuthoritativeCache::new(Arc::new(ProcessContext::new()), fault, 16);

        assert!(cache.get_policy("t1").unwrap().service_write("web"));

        *rules.lock().unwrap() = r#"{"service": {"web": "deny"}}"#.to_string();
        assert!(!cache.get_policy("t1").unwrap().service_write("web"));
        let (acl, etag) = cache.get_acl_policy("t1").unwrap();
        assert!(acl.rules.contains("deny"));
        assert_eq!(etag, acl.etag());
    }

    #[test]
    fn test_clear_acl_drops_entry() {
        let cache = AuthoritativeCache::new(
            Arc::new(ProcessContext::new()),
            counting_fault(Arc::new(AtomicU32::new(0))),
            16,
        );
        let first = cache.get_policy("client").unwrap();
        cache.clear_acl("client");
        let second = cache.get_policy("client").unwrap();
        // Compiled policies are keyed by ETag and survive the token eviction.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_authoritative_management() {
        let cache = AuthoritativeCache::new(
            Arc::new(ProcessContext::new()),
            counting_fault(Arc::new(AtomicU32::new(0))),
            16,
        );
        assert!(cache.get_policy("mgmt").unwrap().acl_list());
        let (acl, etag) = cache.get_acl_policy("mgmt").unwrap();
        assert_eq!(acl.parent, "manage");
        assert!(etag.starts_with("manage:"));
    }

    #[test]
    fn test_authoritative_not_found() {
        let cache = AuthoritativeCache::new(
            Arc::new(ProcessContext::new()),
            counting_fault(Arc::new(AtomicU32::new(0))),
            16,
        );
        assert_eq!(cache.get_policy("missing").unwrap_err(), Error::AclNotFound);
    }
}
