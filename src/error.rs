//! Error types for the RKE machine operator
//!
//! Errors carry enough context (resource kind, namespace, name) to make a
//! stalled reconciliation diagnosable from the controller logs alone.

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource the reconciler depends on does not exist (yet)
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind (e.g., "Cluster", "RKEBootstrap")
        kind: String,
        /// Namespace of the missing resource (empty for cluster-scoped)
        namespace: String,
        /// Name of the missing resource
        name: String,
    },

    /// Bootstrap payload could not be derived
    #[error("bootstrap error for {principal}: {message}")]
    Bootstrap {
        /// Service account the payload was being derived for
        principal: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Invalid input handed to the operator
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "finalizer", "apply")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for a namespaced resource
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a bootstrap error for the given principal
    pub fn bootstrap(principal: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Bootstrap {
            principal: principal.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error means a dependency is not in the store yet
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 404,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
