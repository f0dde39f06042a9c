//! fleetdist - work distribution for worker fleets
//!
//! A library that lets identical worker processes share a keyspace through a
//! lease-capable coordination store, without a central scheduler.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`store`] - Coordination store contract, in-memory store, sessions and watches
//! - [`distribution`] - Membership, consistent-hash ownership and supervision
//! - [`config`] - Configuration management and settings
//! - [`server`] - Status API of a node
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fleetdist::config::Config;
//! use fleetdist::distribution::Node;
//! use fleetdist::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = MemoryStore::new();
//!     let node = Node::new(config.node_id(), Arc::new(store.client()), config.node_config()?).await?;
//!     println!("owner of job-1: {}", node.node_for("job-1")?);
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod distribution;
pub mod error;
pub mod metrics;
pub mod server;
pub mod store;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::distribution::{
        Assigner, BoxError, DistributionError, Events, ExecutorConfig, Listener, Node, NodeConfig,
        RunContext, SupervisorState,
    };
    pub use crate::error::{Error, ErrorCategory, FleetErrorTrait, Result};
    pub use crate::store::{CoordinationStore, MemoryStore, StoreError};
}

pub use distribution::{Assigner, Node, NodeConfig};
