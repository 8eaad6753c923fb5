//! Filtering of read results by a resolved policy.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::policy::Policy;
use crate::cluster::types::{
    AclToken, AclTokenType, CheckServiceNode, HealthCheck, Node, NodeServices, ServiceNode,
    Session,
};
use crate::constants::{REDACTED_TOKEN, SERVER_SERVICE_NAME};

/// A policy applied to read results.
pub struct AclFilter {
    policy: Arc<Policy>,
    enforce_version_8: bool,
}

impl AclFilter {
    pub fn new(policy: Arc<Policy>, enforce_version_8: bool) -> Self {
        Self {
            policy,
            enforce_version_8,
        }
    }

    fn allow_node(&self, node: &str) -> bool {
        !self.enforce_version_8 || self.policy.node_read(node)
    }

    fn allow_service(&self, service: &str) -> bool {
        if service.is_empty() {
            return true;
        }
        if !self.enforce_version_8 && service == SERVER_SERVICE_NAME {
            return true;
        }
        self.policy.service_read(service)
    }

    fn allow_session(&self, node: &str) -> bool {
        !self.enforce_version_8 || self.policy.session_read(node)
    }
}

/// Result kinds that can be filtered in place.
pub enum Filterable<'a> {
    HealthChecks(&'a mut Vec<HealthCheck>),
    /// Service name to tags.
    ServiceMap(&'a mut BTreeMap<String, Vec<String>>),
    ServiceNodes(&'a mut Vec<ServiceNode>),
    NodeServices(&'a mut Option<NodeServices>),
    CheckServiceNodes(&'a mut Vec<CheckServiceNode>),
    Sessions(&'a mut Vec<Session>),
    Nodes(&'a mut Vec<Node>),
    AclTokens(&'a mut Vec<AclToken>),
}

impl Filterable<'_> {
    pub fn filter(self, f: &AclFilter) {
        match self {
            Filterable::HealthChecks(checks) => {
                checks.retain(|c| f.allow_node(&c.node) && f.allow_service(&c.service_name));
            }
            Filterable::ServiceMap(services) => {
                services.retain(|name, _| f.allow_service(name));
            }
            Filterable::ServiceNodes(nodes) => {
                nodes.retain(|n| f.allow_node(&n.node) && f.allow_service(&n.service_name));
            }
            Filterable::NodeServices(services) => {
                if services.as_ref().is_some_and(|ns| !f.allow_node(&ns.node.node)) {
                    *services = None;
                } else if let Some(ns) = services.as_mut() {
                    ns.services.retain(|_, s| f.allow_service(&s.service));
                }
            }
            Filterable::CheckServiceNodes(nodes) => {
                nodes.retain(|n| f.allow_node(&n.node.node) && f.allow_service(&n.service.service));
            }
            Filterable::Sessions(sessions) => {
                sessions.retain(|s| f.allow_session(&s.node));
            }
            Filterable::Nodes(nodes) => {
                nodes.retain(|n| f.allow_node(&n.node));
            }
            Filterable::AclTokens(tokens) => {
                if f.policy.acl_list() {
                    return;
                }
                tokens.retain(|t| t.kind != AclTokenType::Management);
                for token in tokens.iter_mut() {
                    token.id = REDACTED_TOKEN.to_string();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::acl::policy::RootKind;
    use crate::cluster::types::{HealthStatus, NodeService};

    fn policy(rules: &str) -> Arc<Policy> {
        Arc::new(Policy::compile(Arc::new(Policy::Root(RootKind::Deny)), rules).unwrap())
    }

    fn check(node: &str, service: &str) -> HealthCheck {
        HealthCheck {
            node: node.to_string(),
            check_id: format!("{node}-{service}"),
            name: "check".to_string(),
            status: HealthStatus::Passing,
            output: String::new(),
            service_id: service.to_string(),
            service_name: service.to_string(),
            modify_index: 1,
        }
    }

    fn node(name: &str) -> Node {
        Node {
            node: name.to_string(),
            address: "10.0.0.1".to_string(),
            ..Node::default()
        }
    }

    #[test]
    fn test_health_checks_filtered_by_node_and_service() {
        let f = AclFilter::new(
            policy(r#"{"node": {"web-": "read"}, "service": {"web": "read"}}"#),
            true,
        );
        let mut checks = vec![
            check("web-1", "web"),
            check("web-1", "db"),
            check("db-1", "web"),
            check("web-2", ""),
        ];
        Filterable::HealthChecks(&mut checks).filter(&f);
        let kept: Vec<_> = checks.iter().map(|c| c.check_id.as_str()).collect();
        assert_eq!(kept, vec!["web-1-web", "web-2-"]);
    }

    #[test]
    fn test_version_8_disabled_skips_node_rules() {
        let f = AclFilter::new(policy(r#"{"service": {"web": "read"}}"#), false);
        let mut nodes = vec![node("a"), node("b")];
        Filterable::Nodes(&mut nodes).filter(&f);
        assert_eq!(nodes.len(), 2);

        let mut services = BTreeMap::from([
            ("consul".to_string(), vec![]),
            ("web".to_string(), vec![]),
            ("db".to_string(), vec![]),
        ]);
        Filterable::ServiceMap(&mut services).filter(&f);
        assert_eq!(services.keys().collect::<Vec<_>>(), vec!["consul", "web"]);
    }

    #[test]
    fn test_node_services_cleared_when_node_denied() {
        let f = AclFilter::new(policy(r#"{"service": {"": "read"}}"#), true);
        let mut ns = Some(NodeServices {
            node: node("hidden"),
            services: BTreeMap::from([(
                "web".to_string(),
                NodeService {
                    id: "web".to_string(),
                    service: "web".to_string(),
                    port: 80,
                    ..NodeService::default()
                },
            )]),
        });
        Filterable::NodeServices(&mut ns).filter(&f);
        assert!(ns.is_none());
    }

    #[test]
    fn test_sessions_filtered_by_node() {
        let f = AclFilter::new(policy(r#"{"session": {"web-": "read"}}"#), true);
        let mut sessions = vec![
            Session {
                id: "s1".to_string(),
                node: "web-1".to_string(),
                name: String::new(),
                ttl: None,
                create_index: 1,
            },
            Session {
                id: "s2".to_string(),
                node: "db-1".to_string(),
                name: String::new(),
                ttl: None,
                create_index: 2,
            },
        ];
        Filterable::Sessions(&mut sessions).filter(&f);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s1");
    }

    #[test]
    fn test_acl_tokens_redacted_without_list() {
        let token = |id: &str, kind| AclToken {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            rules: String::new(),
            modify_index: 1,
        };
        let mut tokens = vec![
            token("root", AclTokenType::Management),
            token("app", AclTokenType::Client),
        ];

        let f = AclFilter::new(policy(""), true);
        Filterable::AclTokens(&mut tokens).filter(&f);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].id, REDACTED_TOKEN);
        assert_eq!(tokens[0].name, "app");

        let mut all = vec![token("root", AclTokenType::Management)];
        let manage = AclFilter::new(Arc::new(Policy::Root(RootKind::Manage)), true);
        Filterable::AclTokens(&mut all).filter(&manage);
        assert_eq!(all[0].id, "root");
    }
}
