//! Error types for the kestrel engine
//!
//! Errors are structured with fields to aid debugging in production.
//! A few variants are sentinels that callers branch on: `NotFound` for absent
//! keys, `LostLeadership` for guarded writes issued without the leader key,
//! and `Conflict` for optimistic concurrency failures.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kestrel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Key is absent from storage
    #[error("not found: {key}")]
    NotFound {
        /// The storage key that was looked up
        key: String,
    },

    /// A leader-guarded write found the leader key missing
    #[error("lost leadership")]
    LostLeadership,

    /// An optimistic concurrency check failed
    #[error("conflict on {key}: {message}")]
    Conflict {
        /// The key whose revision moved
        key: String,
        /// Description of the mismatch
        message: String,
    },

    /// Validation error for cluster definitions, options or constraints
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "nodes[2].address")
        field: Option<String>,
    },

    /// Remote transport failure (SSH connection or command)
    #[error("transport error [{node}]: {message}")]
    Transport {
        /// Address of the node
        node: String,
        /// Description of what failed
        message: String,
    },

    /// A remote command exceeded its deadline
    #[error("command on {node} timed out after {timeout:?}")]
    Timeout {
        /// Address of the node
        node: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// A remote command exited non-zero
    #[error("command failed on {node} (exit {code:?}): {stderr}")]
    CommandFailed {
        /// Address of the node
        node: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// etcd client error
    #[error("etcd error: {message}")]
    Etcd {
        /// Description of what failed
        message: String,
    },

    /// Secrets backend error
    #[error("secrets backend error [{path}]: {message}")]
    Secrets {
        /// API path that failed
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Resource definition could not be decoded
    #[error("decode error for {kind}: {message}")]
    Decode {
        /// The resource kind (or the raw kind string if unsupported)
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "controller", "probe")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for a key
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a conflict error for a key
    pub fn conflict(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a transport error for a node
    pub fn transport(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create an etcd error
    pub fn etcd(msg: impl Into<String>) -> Self {
        Self::Etcd {
            message: msg.into(),
        }
    }

    /// Create a secrets backend error
    pub fn secrets(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Secrets {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a decode error for a resource kind
    pub fn decode(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Decode {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for the absent-key sentinel
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for the lost-leadership sentinel
    pub fn is_lost_leadership(&self) -> bool {
        matches!(self, Error::LostLeadership)
    }

    /// Check if this error is retryable on a later tick
    ///
    /// Validation, decode and serialization errors need a definition fix.
    /// Leadership loss must stop the process from mutating at all.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Decode { .. } => false,
            Error::Serialization { .. } => false,
            Error::LostLeadership => false,
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => true,
            Error::Transport { .. } => true,
            Error::Timeout { .. } => true,
            Error::CommandFailed { .. } => true,
            Error::Etcd { .. } => true,
            Error::Secrets { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Get the node address if this error is associated with a specific node
    pub fn node(&self) -> Option<&str> {
        match self {
            Error::Transport { node, .. } => Some(node),
            Error::Timeout { node, .. } => Some(node),
            Error::CommandFailed { node, .. } => Some(node),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_distinguishable() {
        assert!(Error::not_found("cluster").is_not_found());
        assert!(!Error::not_found("cluster").is_lost_leadership());
        assert!(Error::LostLeadership.is_lost_leadership());
        assert!(!Error::LostLeadership.is_not_found());
        assert_eq!(Error::LostLeadership.to_string(), "lost leadership");
    }

    #[test]
    fn leadership_loss_is_not_retryable() {
        assert!(!Error::LostLeadership.is_retryable());
    }

    #[test]
    fn validation_carries_cluster_and_field() {
        let err = Error::validation_for_field("prod", "nodes[0].address", "empty address");
        assert!(err.to_string().contains("prod"));
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("nodes[0].address"));
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn remote_errors_expose_node() {
        let err = Error::Timeout {
            node: "10.0.0.1".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.node(), Some("10.0.0.1"));
        assert!(err.is_retryable());

        let err = Error::CommandFailed {
            node: "10.0.0.2".to_string(),
            code: Some(1),
            stderr: "no such container".to_string(),
        };
        assert_eq!(err.node(), Some("10.0.0.2"));
        assert!(err.to_string().contains("no such container"));

        assert_eq!(Error::etcd("boom").node(), None);
    }

    #[test]
    fn decode_errors_are_permanent() {
        let err = Error::decode("Ingress", "unsupported kind");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Ingress"));
    }

    #[test]
    fn default_context_is_unknown() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        let err = Error::internal_with_context("probe", "unexpected state");
        assert!(err.to_string().contains("[probe]"));
    }
}
