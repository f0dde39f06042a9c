//! Error types for the distribution module

use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// Result type for distribution operations
pub type DistributionResult<T> = Result<T, DistributionError>;

/// Distribution-specific errors
#[derive(Debug, Error)]
pub enum DistributionError {
    /// The ring holds no node yet
    #[error("no nodes found")]
    NoNodes,

    /// Coordination store failure
    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),

    /// Node startup did not complete in time
    #[error("node startup timed out after {0:?}")]
    StartupTimeout(Duration),

    /// The registration record could not be written
    #[error("cannot register the node \"{node_id}\": {source}")]
    Registration {
        node_id: String,
        #[source]
        source: StoreError,
    },

    /// The node did not observe its own registration
    #[error("the node \"{node_id}\" did not discover itself within {timeout:?}")]
    SelfDiscoveryTimeout { node_id: String, timeout: Duration },

    /// Invalid configuration value
    #[error("invalid value for '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    /// The first run of a supervised callback failed
    #[error("cannot initialize \"{name}\": {reason}")]
    Initialization { name: String, reason: String },

    /// The node is shutting down
    #[error("the node is shutting down")]
    ShuttingDown,
}

impl DistributionError {
    /// Construct an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Check if the operation may succeed when repeated later
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NoNodes | Self::StartupTimeout(_) | Self::SelfDiscoveryTimeout { .. } => true,
            Self::Store(err) | Self::Registration { source: err, .. } => err.is_recoverable(),
            Self::InvalidConfig { .. } | Self::Initialization { .. } | Self::ShuttingDown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = DistributionError::SelfDiscoveryTimeout {
            node_id: "node1".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(
            err.to_string(),
            "the node \"node1\" did not discover itself within 1s"
        );
        assert_eq!(DistributionError::NoNodes.to_string(), "no nodes found");
    }

    #[test]
    fn test_from_store_error() {
        let err: DistributionError = StoreError::Unavailable.into();
        assert!(matches!(err, DistributionError::Store(StoreError::Unavailable)));
        assert!(err.is_recoverable());
        assert!(!DistributionError::invalid_config("group", "empty").is_recoverable());
    }
}
