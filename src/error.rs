//! Error types for the decoration operator.

use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error types for decoration operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid resource spec
    #[error("Invalid resource spec: {0}")]
    InvalidSpec(String),

    /// A primary-container patch named a container the pod does not have
    #[error("primary container {0:?} not found on pod")]
    PrimaryContainerMissing(String),

    /// A MergePatchJson metadata value was not valid JSON
    #[error("malformed merge patch for key {key:?}: {source}")]
    MalformedMergePatch {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Pod is not owned by a GroupSet
    #[error("pod {0} is not controlled by a GroupSet")]
    NotGroupSetPod(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconcile(String),
}

impl Error {
    /// Transient API failures are retried on the same key; everything else
    /// either waits for a spec change or is a programmer error.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => matches!(ae.code, 409 | 429 | 500 | 503 | 504),
            Error::Kube(_) => true,
            _ => false,
        }
    }
}
