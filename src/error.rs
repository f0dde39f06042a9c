//! Unified error handling for the fleetdist crate
//!
//! This module provides a unified error type that consolidates the
//! domain-specific errors into a single `Error` enum, while the domain errors
//! stay usable on their own.
//!
//! # Architecture
//!
//! - [`FleetErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use fleetdist::error::{Error, FleetErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         println!("Retrying: {err}");
//!     } else {
//!         eprintln!("Fatal error: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::distribution::DistributionError;
pub use crate::store::StoreError;

/// Common trait for all fleetdist error types
pub trait FleetErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Coordination store connectivity and consistency errors
    Store,
    /// Membership, ownership and supervision errors
    Distribution,
    /// Configuration and validation errors
    Config,
    /// File and socket errors
    Io,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short description for log output
    pub fn description(&self) -> &'static str {
        match self {
            Self::Store => "coordination store error",
            Self::Distribution => "distribution error",
            Self::Config => "configuration error",
            Self::Io => "I/O error",
            Self::Other => "other error",
        }
    }
}

impl FleetErrorTrait for StoreError {
    fn is_recoverable(&self) -> bool {
        StoreError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Store
    }
}

impl FleetErrorTrait for DistributionError {
    fn is_recoverable(&self) -> bool {
        DistributionError::is_recoverable(self)
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) | Self::Registration { .. } => ErrorCategory::Store,
            Self::InvalidConfig { .. } => ErrorCategory::Config,
            _ => ErrorCategory::Distribution,
        }
    }
}

/// Unified error type for the fleetdist crate
#[derive(Error, Debug)]
pub enum Error {
    /// Coordination store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Membership and supervision errors
    #[error("Distribution error: {0}")]
    Distribution(#[from] DistributionError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FleetErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_recoverable(),
            Self::Distribution(e) => e.is_recoverable(),
            Self::Config(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Toml(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) => ErrorCategory::Store,
            Self::Distribution(e) => FleetErrorTrait::category(e),
            Self::Config(_) | Self::Toml(_) => ErrorCategory::Config,
            Self::Io(_) => ErrorCategory::Io,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let store_err = Error::Store(StoreError::Unavailable);
        assert_eq!(store_err.category(), ErrorCategory::Store);

        let no_nodes = Error::Distribution(DistributionError::NoNodes);
        assert_eq!(no_nodes.category(), ErrorCategory::Distribution);

        let invalid = Error::Distribution(DistributionError::invalid_config("group", "empty"));
        assert_eq!(invalid.category(), ErrorCategory::Config);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::Store(StoreError::Timeout(std::time::Duration::from_secs(1))).is_recoverable());
        assert!(!Error::Store(StoreError::LeaseNotFound(7)).is_recoverable());
        assert!(!Error::Distribution(DistributionError::ShuttingDown).is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let unified: Error = DistributionError::NoNodes.into();
        assert!(matches!(unified, Error::Distribution(_)));

        let unified: Error = StoreError::Closed.into();
        assert!(matches!(unified, Error::Store(_)));
    }

    #[test]
    fn test_other_error() {
        let err = Error::other("Something went wrong");
        assert_eq!(err.category(), ErrorCategory::Other);
        assert_eq!(err.category().description(), "other error");
        assert!(!err.is_recoverable());
    }
}
