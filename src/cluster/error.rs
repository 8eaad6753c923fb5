//! Error types for the coordination core.
//!
//! # Error Classes
//!
//! Errors fall into three classes, and callers are expected to treat them
//! differently:
//!
//! ## Transient
//!
//! No leader yet, an RPC timeout, a dropped transport stream. These are
//! retried with bounded jittered backoff (see [`super::retry`]) or skipped
//! for one cycle. They are never surfaced beyond the retry window.
//!
//! ## Policy-governed
//!
//! ACL resolution failures while the authoritative datacenter is unreachable.
//! These are resolved by the configured down policy and never reach the
//! caller as an error. "ACL not found" is the exception: it is definitive and
//! propagates immediately.
//!
//! ## Structural
//!
//! Malformed configuration, permission denied on a write, invalid policy
//! rules. Surfaced directly, except permission denied during membership
//! reconciliation which the reconciler swallows.
//!
//! # Remote Errors
//!
//! Errors that crossed the RPC transport arrive as [`Error::Rpc`] with only a
//! message. The classification helpers fall back to matching the well-known
//! message text so that a "Permission denied" raised on another server is
//! still recognised as one locally.

use thiserror::Error as ThisError;

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Message text used when no leader is known. Matched on remote errors.
pub const ERR_NO_LEADER: &str = "No cluster leader";

/// Message text used for permission failures. Matched on remote errors.
pub const ERR_PERMISSION_DENIED: &str = "Permission denied";

/// Message text used for unknown ACL tokens. Matched on remote errors.
pub const ERR_ACL_NOT_FOUND: &str = "ACL not found";

/// Errors produced by the coordination core.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// No leader is currently known and the hold timeout expired.
    #[error("No cluster leader")]
    NoLeader,

    /// No route is known to the requested datacenter.
    #[error("No path to datacenter: {0}")]
    NoDcPath(String),

    /// The resolved policy does not allow the operation.
    #[error("Permission denied")]
    PermissionDenied,

    /// The token does not exist in the authoritative datacenter.
    #[error("ACL not found")]
    AclNotFound,

    /// A built-in root policy name was presented as a token.
    #[error("Cannot resolve root ACL: {0}")]
    RootDenied(String),

    /// The operation needs the authoritative ACL datacenter.
    #[error("Not ACL datacenter")]
    NotAuthoritative,

    /// A remote call returned an error.
    #[error("RPC {method} to {target} failed: {message}")]
    Rpc {
        method: String,
        target: String,
        message: String,
    },

    /// The transport stream broke before a reply arrived.
    #[error("RPC stream error: {0}")]
    Stream(String),

    /// A bounded wait expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The consensus layer rejected or failed an operation.
    #[error("Consensus error: {0}")]
    Consensus(String),

    /// The state store failed a read.
    #[error("State store error: {0}")]
    Store(String),

    /// No alive servers were found in the local datacenter.
    #[error("No servers found")]
    NoServers,

    /// Token rule text could not be compiled.
    #[error("Invalid policy rules: {0}")]
    PolicyParse(String),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serde(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cluster does not yet support the requested operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Build an RPC error from its parts.
    pub fn rpc(method: &str, target: impl ToString, message: impl ToString) -> Self {
        Error::Rpc {
            method: method.to_string(),
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    /// Returns true if this error means the caller lacks permission.
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::PermissionDenied => true,
            Error::Rpc { message, .. } => message.contains(ERR_PERMISSION_DENIED),
            _ => false,
        }
    }

    /// Returns true if this error means the token does not exist.
    pub fn is_acl_not_found(&self) -> bool {
        match self {
            Error::AclNotFound => true,
            Error::Rpc { message, .. } => message.contains(ERR_ACL_NOT_FOUND),
            _ => false,
        }
    }

    /// Returns true if this error means no leader is known.
    pub fn is_no_leader(&self) -> bool {
        match self {
            Error::NoLeader => true,
            Error::Rpc { message, .. } => message.contains(ERR_NO_LEADER),
            _ => false,
        }
    }

    /// Returns true if the transport stream broke mid-call.
    pub fn is_stream_error(&self) -> bool {
        matches!(self, Error::Stream(_))
    }

    /// Check if this error is transient and worth retrying.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::NoLeader | Error::Timeout(_) | Error::Stream(_) | Error::Consensus(_) => true,
            Error::Rpc { .. } => {
                self.is_no_leader() || !(self.is_permission_denied() || self.is_acl_not_found())
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        assert!(Error::PermissionDenied.is_permission_denied());
        assert!(Error::rpc("Catalog.Register", "10.0.0.1:8300", "Permission denied").is_permission_denied());
        assert!(!Error::NoLeader.is_permission_denied());
    }

    #[test]
    fn test_acl_not_found_from_remote_message() {
        let err = Error::rpc("ACL.GetPolicy", "dc1", "rpc error: ACL not found");
        assert!(err.is_acl_not_found());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_no_leader_is_retriable() {
        assert!(Error::NoLeader.is_retriable());
        assert!(Error::rpc("KVS.Get", "10.0.0.2:8300", "No cluster leader").is_no_leader());
        assert!(Error::rpc("KVS.Get", "10.0.0.2:8300", "No cluster leader").is_retriable());
    }

    #[test]
    fn test_structural_errors_not_retriable() {
        assert!(!Error::Config("bad".into()).is_retriable());
        assert!(!Error::PolicyParse("bad".into()).is_retriable());
        assert!(!Error::RootDenied("allow".into()).is_retriable());
    }

    #[test]
    fn test_stream_error() {
        let err = Error::Stream("connection reset".into());
        assert!(err.is_stream_error());
        assert!(err.is_retriable());
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::NoDcPath("dc9".into()).to_string(), "No path to datacenter: dc9");
        assert_eq!(Error::AclNotFound.to_string(), "ACL not found");
    }
}
