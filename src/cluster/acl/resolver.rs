//! Token resolution.
//!
//! [`AclResolver::resolve_token`] turns a token id into a compiled policy.
//! Inside the ACL datacenter the leader answers from its authoritative cache;
//! everywhere else tokens are fetched from the ACL datacenter, cached for the
//! returned TTL and refreshed with an ETag so unchanged policies are never
//! recompiled.
//!
//! When the ACL datacenter cannot be reached the configured down policy
//! decides the outcome. "ACL not found" is definitive and always propagates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use super::cache::{AclCacheEntry, AclFaultFn, AuthoritativeCache, FaultedAcl};
use super::filter::{AclFilter, Filterable};
use super::policy::{Policy, RootKind};
use crate::cluster::config::{AclDefaultPolicy, AclDownPolicy, ServerConfig};
use crate::cluster::context::ProcessContext;
use crate::cluster::error::{Error, Result};
use crate::cluster::metrics;
use crate::cluster::traits::Consensus;
use crate::cluster::types::AclTokenType;
use crate::constants::{ACL_CACHE_SIZE, ANONYMOUS_TOKEN, ROOT_POLICY_MANAGE};

/// Policy fetch sent to the ACL datacenter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRequest {
    pub datacenter: String,
    pub acl: String,
    /// ETag of the cached copy, if any.
    #[serde(default)]
    pub etag: Option<String>,
}

/// Policy returned by the ACL datacenter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReply {
    pub etag: String,
    pub parent: String,
    /// Rule text. Omitted when the request's ETag is current.
    #[serde(default)]
    pub policy: Option<String>,
    pub ttl: Duration,
}

/// Where non-authoritative servers fetch policies from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn get_policy(&self, request: &PolicyRequest) -> Result<PolicyReply>;
}

/// Fault function reading tokens from the local state store.
///
/// Management tokens inherit from `manage`; every other token compiles its
/// rules on top of the datacenter's default policy.
pub fn state_store_fault(consensus: Arc<dyn Consensus>, default: AclDefaultPolicy) -> AclFaultFn {
    Arc::new(move |id: &str| {
        let (_, token) = consensus.state().acl_get(None, id)?;
        let token = token.ok_or(Error::AclNotFound)?;
        Ok(match token.kind {
            AclTokenType::Management => FaultedAcl {
                parent: ROOT_POLICY_MANAGE.to_string(),
                rules: String::new(),
            },
            AclTokenType::Client => FaultedAcl {
                parent: default.to_string(),
                rules: token.rules,
            },
        })
    })
}

/// Resolves tokens to compiled policies.
pub struct AclResolver {
    config: Arc<ServerConfig>,
    ctx: Arc<ProcessContext>,
    consensus: Arc<dyn Consensus>,
    remote: Arc<dyn PolicySource>,
    authoritative: Option<AuthoritativeCache>,
    local: Option<AclFaultFn>,
    entries: Cache<String, Arc<AclCacheEntry>>,
    policies: Cache<String, Arc<Policy>>,
}

impl AclResolver {
    pub fn new(
        config: Arc<ServerConfig>,
        ctx: Arc<ProcessContext>,
        consensus: Arc<dyn Consensus>,
        remote: Arc<dyn PolicySource>,
    ) -> Self {
        let authoritative = config.is_acl_authoritative().then(|| {
            AuthoritativeCache::new(
                ctx.clone(),
                state_store_fault(consensus.clone(), config.acl_default_policy),
                ACL_CACHE_SIZE,
            )
        });
        let local = (config.acl_replication && !config.is_acl_authoritative())
            .then(|| state_store_fault(consensus.clone(), config.acl_default_policy));

        Self {
            config,
            ctx,
            consensus,
            remote,
            authoritative,
            local,
            entries: Cache::new(ACL_CACHE_SIZE),
            policies: Cache::new(ACL_CACHE_SIZE),
        }
    }

    /// Replace the local replica lookup used under `extend-cache`.
    pub fn with_local_fault(mut self, fault: AclFaultFn) -> Self {
        self.local = Some(fault);
        self
    }

    /// Resolve a token to its policy. `None` when ACLs are disabled.
    pub async fn resolve_token(&self, id: &str) -> Result<Option<Arc<Policy>>> {
        let Some(auth_dc) = self.config.acl_datacenter.as_deref().filter(|dc| !dc.is_empty())
        else {
            return Ok(None);
        };

        let id = if id.is_empty() { ANONYMOUS_TOKEN } else { id };
        if RootKind::from_name(id).is_some() {
            return Err(Error::RootDenied(id.to_string()));
        }

        if let Some(auth) = &self.authoritative
            && self.consensus.is_leader()
        {
            return auth.get_policy(id).map(Some);
        }

        self.lookup_acl(id.to_string(), auth_dc.to_string())
            .await
            .map(Some)
    }

    fn lookup_acl(&self, id: String, auth_dc: String) -> BoxFuture<'_, Result<Arc<Policy>>> {
        Box::pin(async move {
            let cached = self.entries.get(&id);
            if let Some(entry) = &cached
                && !entry.is_expired()
            {
                metrics::record_acl_cache("hit");
                return Ok(entry.policy());
            }
            metrics::record_acl_cache("miss");

            let request = PolicyRequest {
                datacenter: auth_dc.clone(),
                acl: id.clone(),
                etag: cached.as_ref().map(|e| e.etag().to_string()),
            };
            let err = match self.remote.get_policy(&request).await {
                Ok(reply) => return self.use_policy(&id, &auth_dc, cached, reply).await,
                Err(e) => e,
            };

            if err.is_acl_not_found() {
                return Err(Error::AclNotFound);
            }
            tracing::error!(error = %err, datacenter = %auth_dc, "Failed to get policy from ACL datacenter");

            if self.config.acl_down_policy == AclDownPolicy::ExtendCache
                && let Some(local) = &self.local
            {
                match local(&id) {
                    Ok(acl) => {
                        metrics::record_acl_cache("replication_hit");
                        let reply = PolicyReply {
                            etag: acl.etag(),
                            parent: acl.parent,
                            policy: Some(acl.rules),
                            ttl: self.config.acl_ttl,
                        };
                        return self.use_policy(&id, &auth_dc, cached, reply).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Local ACL fallback failed, applying down policy");
                    }
                }
            }

            metrics::record_acl_down_policy(&self.config.acl_down_policy.to_string());
            match self.config.acl_down_policy {
                AclDownPolicy::Allow => Ok(self.ctx.allow_all()),
                AclDownPolicy::ExtendCache => match cached {
                    Some(entry) => Ok(entry.policy()),
                    None => Ok(self.ctx.deny_all()),
                },
                AclDownPolicy::Deny => Ok(self.ctx.deny_all()),
            }
        })
    }

    async fn use_policy(
        &self,
        id: &str,
        auth_dc: &str,
        cached: Option<Arc<AclCacheEntry>>,
        reply: PolicyReply,
    ) -> Result<Arc<Policy>> {
        if let Some(entry) = cached
            && entry.etag() == reply.etag
        {
            metrics::record_acl_cache("etag_refresh");
            entry.extend(reply.ttl);
            return Ok(entry.policy());
        }

        let policy = match self.policies.get(&reply.etag) {
            Some(policy) => policy,
            None => {
                let parent = match self.ctx.root_policy(&reply.parent) {
                    Some(root) => root,
                    None => {
                        self.lookup_acl(reply.parent.clone(), auth_dc.to_string())
                            .await?
                    }
                };
                let rules = reply.policy.as_deref().unwrap_or_default();
                let policy = Arc::new(Policy::compile(parent, rules)?);
                self.policies.insert(reply.etag.clone(), policy.clone());
                policy
            }
        };

        let entry = AclCacheEntry::new(policy.clone(), reply.etag, reply.ttl);
        self.entries.insert(id.to_string(), Arc::new(entry));
        Ok(policy)
    }

    /// Serve a policy fetch from another datacenter.
    ///
    /// Rules are omitted when the caller's ETag is current.
    pub fn get_policy(&self, request: &PolicyRequest) -> Result<PolicyReply> {
        let auth = self.authoritative.as_ref().ok_or(Error::NotAuthoritative)?;
        let (acl, etag) = auth.get_acl_policy(&request.acl)?;
        let policy = if request.etag.as_deref() == Some(etag.as_str()) {
            None
        } else {
            Some(acl.rules)
        };

        Ok(PolicyReply {
            etag,
            parent: acl.parent,
            policy,
            ttl: self.config.acl_ttl,
        })
    }

    /// Filter a read result down to what the token may see.
    pub async fn filter_result(&self, token: &str, target: Filterable<'_>) -> Result<()> {
        if let Some(policy) = self.resolve_token(token).await? {
            target.filter(&AclFilter::new(policy, self.config.acl_enforce_version_8));
        }
        Ok(())
    }

    /// Forget one token after it was written or deleted.
    pub fn clear_acl(&self, id: &str) {
        if let Some(auth) = &self.authoritative {
            auth.clear_acl(id);
        }
        self.entries.invalidate(id);
    }

    /// Drop everything the authoritative cache holds.
    pub fn purge_authoritative(&self) {
        if let Some(auth) = &self.authoritative {
            auth.purge();
        }
    }

    /// Drop every non-authoritative entry.
    pub fn purge(&self) {
        self.entries.invalidate_all();
        self.policies.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mock::{MockConsensus, MockPolicySource};
    use crate::cluster::types::AclToken;

    fn config(dc: &str, acl_dc: &str) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            datacenter: dc.to_string(),
            acl_datacenter: Some(acl_dc.to_string()),
            ..ServerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_disabled_acls_resolve_to_none() {
        let consensus = Arc::new(MockConsensus::new());
        let resolver = AclResolver::new(
            Arc::new(ServerConfig::default()),
            Arc::new(ProcessContext::new()),
            consensus,
            Arc::new(MockPolicySource::new()),
        );
        assert!(resolver.resolve_token("anything").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_root_names_are_rejected() {
        let resolver = AclResolver::new(
            config("dc2", "dc1"),
            Arc::new(ProcessContext::new()),
            Arc::new(MockConsensus::new()),
            Arc::new(MockPolicySource::new()),
        );
        let err = resolver.resolve_token("manage").await.unwrap_err();
        assert_eq!(err, Error::RootDenied("manage".to_string()));
    }

    #[tokio::test]
    async fn test_empty_token_is_anonymous() {
        let source = Arc::new(MockPolicySource::new());
        source.set_reply(ANONYMOUS_TOKEN, "deny", "", Duration::from_secs(30));
        let resolver = AclResolver::new(
            config("dc2", "dc1"),
            Arc::new(ProcessContext::new()),
            Arc::new(MockConsensus::new()),
            source.clone(),
        );

        let policy = resolver.resolve_token("").await.unwrap().unwrap();
        assert!(!policy.node_read("n1"));
        assert_eq!(source.requests()[0].acl, ANONYMOUS_TOKEN);
    }

    #[tokio::test]
    async fn test_authoritative_leader_reads_store() {
        let consensus = Arc::new(MockConsensus::new());
        consensus.set_leader(true);
        consensus.store().insert_acl(AclToken {
            id: "t1".to_string(),
            name: "web".to_string(),
            kind: AclTokenType::Client,
            rules: r#"{"service": {"web": "write"}}"#.to_string(),
            modify_index: 1,
        });
        let source = Arc::new(MockPolicySource::new());
        let resolver = AclResolver::new(
            Arc::new(ServerConfig {
                acl_datacenter: Some("dc1".to_string()),
                acl_default_policy: AclDefaultPolicy::Deny,
                ..ServerConfig::default()
            }),
            Arc::new(ProcessContext::new()),
            consensus,
            source.clone(),
        );

        let policy = resolver.resolve_token("t1").await.unwrap().unwrap();
        assert!(policy.service_write("web"));
        assert!(!policy.service_read("db"));
        assert_eq!(source.call_count(), 0);

        let reply = resolver
            .get_policy(&PolicyRequest {
                datacenter: "dc1".to_string(),
                acl: "t1".to_string(),
                etag: None,
            })
            .unwrap();
        assert_eq!(reply.parent, "deny");
        assert!(reply.policy.is_some());

        let unchanged = resolver
            .get_policy(&PolicyRequest {
                datacenter: "dc1".to_string(),
                acl: "t1".to_string(),
                etag: Some(reply.etag.clone()),
            })
            .unwrap();
        assert_eq!(unchanged.etag, reply.etag);
        assert!(unchanged.policy.is_none());
    }

    #[tokio::test]
    async fn test_get_policy_outside_acl_datacenter() {
        let resolver = AclResolver::new(
            config("dc2", "dc1"),
            Arc::new(ProcessContext::new()),
            Arc::new(MockConsensus::new()),
            Arc::new(MockPolicySource::new()),
        );
        let err = resolver
            .get_policy(&PolicyRequest {
                datacenter: "dc1".to_string(),
                acl: "t1".to_string(),
                etag: None,
            })
            .unwrap_err();
        assert_eq!(err, Error::NotAuthoritative);
    }
}
