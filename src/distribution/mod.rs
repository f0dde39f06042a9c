//! Work distribution across a fleet of nodes
//!
//! This module lets a set of identical worker processes split a keyspace
//! between themselves without a central coordinator. Every process runs a
//! [`Node`] which registers in the coordination store under a lease and
//! follows the registrations of the other members of its group.
//!
//! # Overview
//!
//! Ownership is computed locally with a consistent hash ring: every node that
//! sees the same membership assigns every key to the same owner. When the
//! membership changes, only the keys of the joining or leaving node move.
//!
//! Long-running work is attached to a node through a supervisor. It restarts
//! the work on every membership change and periodically, so each run sees a
//! fresh snapshot of the assignment and picks up the keys it now owns.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────────────── Node ─────────────────────────────┐
//!  │                                                               │
//!  │  Session ──► registration record  (lease, keep-alive)         │
//!  │                                                               │
//!  │  get all + watch ──► Membership ──► Assigner (hash ring)      │
//!  │                          │                                    │
//!  │                          ▼                                    │
//!  │                      Listeners ──► Supervisors (executor/work)│
//!  └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`ring`] - consistent hash ring with virtual points
//! - [`assigner`] - ownership queries over a set of nodes
//! - [`listener`] - batched membership change notifications
//! - [`executor`] - restart-on-change supervision of executors and works
//! - [`node`] - node lifecycle: registration, membership, shutdown
//! - [`config`] - node and executor configuration
//! - [`error`] - error types
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fleetdist::distribution::{ExecutorConfig, Node, NodeConfig};
//! use fleetdist::store::MemoryStore;
//!
//! let store = MemoryStore::new();
//! let node = Node::new("worker-1", Arc::new(store.client()), NodeConfig::default()).await?;
//!
//! node.start_executor("jobs", ExecutorConfig::default(), |ctx| async move {
//!     for job in ["a", "b", "c"] {
//!         if ctx.assigner().must_check_is_owner(job) {
//!             // handle the job on this node
//!         }
//!     }
//!     Ok(())
//! })
//! .await?;
//!
//! node.shutdown().await;
//! ```

pub mod assigner;
pub mod config;
pub mod error;
pub mod executor;
pub mod listener;
pub mod node;
pub mod ring;

pub use assigner::Assigner;
pub use config::{ExecutorConfig, NodeConfig, NodeConfigBuilder, DEFAULT_GROUP};
pub use error::{DistributionError, DistributionResult};
pub use executor::{BoxError, ResetReason, RunContext, SupervisorState};
pub use listener::{Event, EventType, Events, Listener};
pub use node::Node;
pub use ring::HashRing;
