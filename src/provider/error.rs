//! Error type shared by every provider adapter.

use thiserror::Error;

use crate::composite_id::CompositeIdError;
use crate::transport::TransportError;

/// Errors raised by provider adapters.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// Raised when credentials or required parameters are missing or invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem and how to fix it.
        message: String,
    },
    /// Raised when the provider rejects a call or cannot be reached.
    #[error("{operation} failed for {resource}: {message}")]
    ProviderApi {
        /// Operation being performed (for example `create droplet`).
        operation: String,
        /// Resource the operation targeted.
        resource: String,
        /// Message returned by the provider or transport.
        message: String,
    },
    /// Raised when the addressed resource no longer exists.
    #[error("{resource} not found")]
    NotFound {
        /// Resource that could not be found.
        resource: String,
    },
    /// Raised when a delete-by-IP lookup finds no matching host.
    #[error("no host with ip: {ip}")]
    NoHostWithIp {
        /// Address that was searched for.
        ip: String,
    },
    /// Raised when a composite identifier is malformed.
    #[error(transparent)]
    CompositeId(#[from] CompositeIdError),
    /// Raised when a provider lacks a capability.
    #[error("{provider} does not support {operation}")]
    Unsupported {
        /// Provider name.
        provider: String,
        /// Operation that is unavailable.
        operation: String,
    },
    /// Raised when cleanup after a partial failure also failed.
    #[error("{original}; rollback failed: {rollback}")]
    RollbackFailed {
        /// Error that triggered the rollback.
        original: String,
        /// Error raised while removing the partially created resources.
        rollback: String,
    },
}

impl ProvisionError {
    /// Builds a [`Self::ProviderApi`] error.
    #[must_use]
    pub fn api(
        operation: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ProviderApi {
            operation: operation.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Builds a [`Self::Configuration`] error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Reports whether the error means the resource is already gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Wraps a transport failure with operation context.
    #[must_use]
    pub fn transport(operation: &str, resource: &str, err: &TransportError) -> Self {
        Self::api(operation, resource, err.to_string())
    }

    /// Combines this error with a failed rollback.
    #[must_use]
    pub fn with_rollback_failure(self, rollback: &Self) -> Self {
        Self::RollbackFailed {
            original: self.to_string(),
            rollback: rollback.to_string(),
        }
    }
}
