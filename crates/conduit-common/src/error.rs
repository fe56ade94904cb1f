//! Error types for the conduit operator
//!
//! Only infrastructure failures are errors. A configuration that fails to
//! merge or that the runtime rejects is a terminal *outcome* recorded in
//! status, never an `Error`, so nothing here asks the controller to retry
//! known-bad content.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for conduit operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A custom resource is structurally unusable (e.g. missing namespace)
    #[error("invalid resource {resource}: {message}")]
    InvalidResource {
        /// Identity of the offending resource
        resource: String,
        /// Description of what's wrong
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

    /// The validation pod did not reach a terminal phase before the deadline
    #[error("config validation for {workload} did not finish within {}s", timeout.as_secs())]
    ValidationTimeout {
        /// Workload whose configuration was being validated
        workload: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// A long-running wait was abandoned because the operator is shutting down
    #[error("cancelled during {context}")]
    Cancelled {
        /// What was in progress
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "router", "runner")
        context: String,
    },
}

impl Error {
    /// Create an invalid-resource error
    pub fn invalid_resource(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidResource {
            resource: resource.into(),
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

    /// Create a validation timeout error
    pub fn validation_timeout(workload: impl Into<String>, timeout: Duration) -> Self {
        Self::ValidationTimeout {
            workload: workload.into(),
            timeout,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
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
    /// Kubernetes 4xx responses, invalid resources, and serialization errors
    /// need a spec or code change and will not heal on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::InvalidResource { .. } => false,
            Error::Serialization { .. } => false,
            Error::ValidationTimeout { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this is a Kubernetes NotFound response
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Check if this is a Kubernetes AlreadyExists / Conflict response
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Cancelled { context } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("synthetic {code}"),
            reason: String::new(),
            code,
        }),
    }
}
