//! Coordination store contract
//!
//! The distribution layer talks to a linearizable, lease-capable key-value
//! store through the [`CoordinationStore`] trait. The contract is the subset
//! of etcd semantics the layer relies on:
//!
//! - `put` with an optional lease, keys bound to a lease vanish with it
//! - `get_prefix` returns a consistent snapshot and its revision
//! - `watch_prefix` streams changes after a revision, deletes carry the previous value
//! - leases are granted with a TTL and kept alive explicitly
//!
//! # Modules
//!
//! - [`etcd`] - etcd v3 implementation, shared by nodes in separate processes
//! - [`memory`] - embedded in-memory implementation, used by tests and the simulator
//! - [`session`] - resilient lease keep-alive exposing created/lost events
//! - [`watch`] - "get all, then watch from the revision" stream with restarts

pub mod etcd;
pub mod memory;
pub mod session;
pub mod watch;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use etcd::{EtcdConfig, EtcdStore};
pub use memory::{MemoryClient, MemoryStore, MemoryStoreConfig};
pub use session::{Session, SessionConfig, SessionEvent};
pub use watch::{get_all_and_watch, WatchMessage};

/// Store revision, increases with every modification
pub type Revision = i64;

/// Lease identifier
pub type LeaseId = i64;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Receiving side of a raw watch stream
pub type WatchReceiver = mpsc::UnboundedReceiver<StoreResult<WatchBatch>>;

// ============================================================================
// Data Types
// ============================================================================

/// A stored key and its metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub lease: Option<LeaseId>,
    pub create_revision: Revision,
    pub mod_revision: Revision,
}

/// Kind of a key modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One key modification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventType,
    pub kv: KeyValue,
    /// Previous state of the key, always present for deletes
    pub prev_kv: Option<KeyValue>,
}

/// Consistent view of a prefix
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub revision: Revision,
    pub kvs: Vec<KeyValue>,
}

/// Events committed in one revision
#[derive(Debug, Clone)]
pub struct WatchBatch {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

// ============================================================================
// Errors
// ============================================================================

/// Coordination store errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached
    #[error("coordination store is unavailable")]
    Unavailable,

    /// The lease expired or was revoked
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// The requested revision is no longer in the history
    #[error("required revision {requested} has been compacted, compacted revision is {compacted}")]
    Compacted {
        requested: Revision,
        compacted: Revision,
    },

    /// The operation did not finish in time
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The watch stream was closed by the store
    #[error("watch stream closed")]
    Closed,
}

impl StoreError {
    /// Check if the error is transient and the operation can be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Timeout(_) | Self::Closed)
    }
}

/// Run a store operation with a deadline
pub(crate) async fn with_timeout<T, F>(limit: Duration, operation: F) -> StoreResult<T>
where
    F: std::future::Future<Output = StoreResult<T>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}

// ============================================================================
// Store Trait
// ============================================================================

/// Linearizable, lease-capable key-value store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a new lease with the TTL
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Renew the lease once, its TTL starts again
    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<()>;

    /// Revoke the lease, all keys bound to it are deleted
    async fn revoke(&self, lease: LeaseId) -> StoreResult<()>;

    /// Create or update the key
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<Revision>;

    /// Delete the key, returns the previous value if the key existed
    async fn delete(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// Load all keys with the prefix
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Snapshot>;

    /// Stream modifications of keys with the prefix, starting at `from_revision`
    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> StoreResult<WatchReceiver>;
}
