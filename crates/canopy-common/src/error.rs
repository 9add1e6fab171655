//! Error types shared by every Canopy component
//!
//! Variants carry the object they concern so a log line is enough to find
//! the offending workspace, namespace or cluster.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Canopy operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A write broke a lifecycle rule (phase order, immutable field, unset location)
    #[error("policy violation for {object}: {message}")]
    PolicyViolation {
        /// Name of the object being written
        object: String,
        /// Reason reported back to the caller
        message: String,
        /// Offending field path (e.g. "status.phase")
        field: Option<String>,
    },

    /// A value is syntactically invalid (e.g. initializer label too long)
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Name of the object with the invalid value
        object: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path
        field: Option<String>,
    },

    /// Object vanished from the cache or API server
    #[error("{kind} {key} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Cluster-aware key or name
        key: String,
    },

    /// Optimistic-concurrency conflict on a write
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Cluster-aware key or name
        key: String,
        /// Server message
        message: String,
    },

    /// A cache was read before its initial synchronization finished
    #[error("{component} is not ready")]
    NotReady {
        /// Component that has not synced yet
        component: String,
    },

    /// A queue or cache key could not be decoded
    #[error("malformed key {key:?}: {message}")]
    MalformedKey {
        /// The raw key
        key: String,
        /// What is wrong with it
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "scheduler", "informer")
        context: String,
    },
}

impl Error {
    /// Create a policy violation for the named object
    pub fn policy_violation(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PolicyViolation {
            object: object.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a policy violation pointing at a field
    pub fn policy_violation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::PolicyViolation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a validation error without object context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        object: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(
        kind: impl Into<String>,
        key: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a not-ready error for a component
    pub fn not_ready(component: impl Into<String>) -> Self {
        Self::NotReady {
            component: component.into(),
        }
    }

    /// Create a malformed key error
    pub fn malformed_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            message: msg.into(),
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
    /// Conflicts and transient API failures are requeued with backoff.
    /// Policy, validation, malformed-key and serialization errors are not:
    /// retrying cannot change the outcome.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::PolicyViolation { .. } => false,
            Error::Validation { .. } => false,
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => true,
            Error::NotReady { .. } => true,
            Error::MalformedKey { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True for optimistic-concurrency conflicts
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
