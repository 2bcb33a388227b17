//! Error types for the EMQX operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Transport and tunnel failures are kept apart from semantic negative
//! results: a broker answering "unavailable" is data, not an error, and never
//! shows up here.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for EMQX operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for cluster specs, surfaced verbatim at admission
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.bootstrapConfig")
        field: Option<String>,
    },

    /// Operator configuration error
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
    },

    /// Tunnel to a pod's admin port could not be established
    #[error("tunnel to {pod}:{port} failed: {message}")]
    Tunnel {
        /// Pod the tunnel targets
        pod: String,
        /// Remote port on the pod
        port: u16,
        /// Description of what failed
        message: String,
    },

    /// Request over an established tunnel failed before a response arrived
    #[error("admin request to {pod} failed: {message}")]
    Transport {
        /// Pod the request was sent to
        pod: String,
        /// Description of what failed
        message: String,
    },

    /// Writing the serving condition onto a pod failed
    #[error("failed to patch pod conditions for {pod}: {source}")]
    PodCondition {
        /// Pod whose status patch failed
        pod: String,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A code path was reached for a resource that cannot support it
    #[error("invariant violated for {cluster}: {message}")]
    Invariant {
        /// Name of the cluster being reconciled
        cluster: String,
        /// Description of the violated invariant
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "webhook")
        context: String,
    },
}

impl Error {
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

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a tunnel establishment error
    pub fn tunnel(pod: impl Into<String>, port: u16, msg: impl Into<String>) -> Self {
        Self::Tunnel {
            pod: pod.into(),
            port,
            message: msg.into(),
        }
    }

    /// Create a request transport error
    pub fn transport(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Wrap a failure to write a pod's condition with the pod identity
    pub fn pod_condition(pod: impl Into<String>, source: Error) -> Self {
        Self::PodCondition {
            pod: pod.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an invariant violation error
    pub fn invariant(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Invariant {
            cluster: cluster.into(),
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

    /// Check if this error is retryable
    ///
    /// Tunnel and transport failures are infrastructure problems and retry.
    /// Write conflicts (409) retry by recomputing on the next pass. Other 4xx
    /// responses, validation and invariant violations need a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Config { .. } => false,
            Error::Tunnel { .. } => true,
            Error::Transport { .. } => true,
            Error::PodCondition { source, .. } => source.is_retryable(),
            Error::Serialization { .. } => false,
            Error::Invariant { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the platform rejected a write because the object changed underneath us
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            Error::PodCondition { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// True for tunnel and transport failures, including wrapped ones
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Tunnel { .. } | Error::Transport { .. } => true,
            Error::PodCondition { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Invariant { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the pod name if this error is associated with a specific pod
    pub fn pod(&self) -> Option<&str> {
        match self {
            Error::Tunnel { pod, .. } => Some(pod),
            Error::Transport { pod, .. } => Some(pod),
            Error::PodCondition { pod, .. } => Some(pod),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
