//! Access control: compiled policies, token caches and result filtering.

pub mod cache;
pub mod filter;
pub mod policy;
pub mod resolver;

pub use cache::{AclCacheEntry, AclFaultFn, AuthoritativeCache, FaultedAcl};
pub use filter::{AclFilter, Filterable};
pub use policy::{Access, Policy, PolicyRules, RootKind};
pub use resolver::{AclResolver, PolicyReply, PolicyRequest, PolicySource, state_store_fault};
