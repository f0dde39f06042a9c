//! Embedded coordination store
//!
//! A single-process, linearizable key-value store with etcd-like semantics:
//! a global revision counter, TTL leases, prefix watches with a bounded
//! history (older revisions are compacted) and previous values on deletes.
//!
//! Each [`MemoryClient`] is an independent connection to the shared state and
//! can be disconnected to simulate network partitions or a crashed process.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    CoordinationStore, EventType, KeyValue, LeaseId, Revision, Snapshot, StoreError, StoreResult,
    WatchBatch, WatchEvent, WatchReceiver,
};
use crate::utils::lock;

/// Embedded store configuration
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Number of events kept for watches started from a past revision
    pub history_limit: usize,

    /// How often expired leases are collected
    pub reaper_interval: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            reaper_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    client: u64,
    prefix: String,
    tx: mpsc::UnboundedSender<StoreResult<WatchBatch>>,
}

struct State {
    revision: Revision,
    compacted: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    history: VecDeque<(Revision, WatchEvent)>,
    history_limit: usize,
    watchers: Vec<Watcher>,
}

impl State {
    fn new(history_limit: usize) -> Self {
        Self {
            revision: 0,
            compacted: 0,
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease: 1,
            history: VecDeque::new(),
            history_limit,
            watchers: Vec::new(),
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            debug!(lease = id, "lease expired");
            self.revoke_lease(id);
        }
    }

    fn revoke_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };

        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();

        let mut events = Vec::with_capacity(keys.len());
        let revision = self.revision + 1;
        for key in keys {
            if let Some(prev) = self.kvs.remove(&key) {
                events.push(delete_event(prev, revision));
            }
        }

        if !events.is_empty() {
            self.revision = revision;
            self.commit(revision, events);
        }
        true
    }

    fn detach_from_lease(&mut self, kv: &KeyValue) {
        if let Some(lease) = kv.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(&kv.key);
        }
    }

    /// Record the events of one revision and deliver them to matching watchers.
    fn commit(&mut self, revision: Revision, events: Vec<WatchEvent>) {
        for event in &events {
            self.history.push_back((revision, event.clone()));
        }
        while self.history.len() > self.history_limit {
            if let Some((rev, _)) = self.history.pop_front() {
                self.compacted = self.compacted.max(rev);
            }
        }

        self.watchers.retain(|watcher| {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.kv.key.starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if matching.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(Ok(WatchBatch {
                    revision,
                    events: matching,
                }))
                .is_ok()
        });
    }

    fn prefix_kvs(&self, prefix: &str) -> Vec<KeyValue> {
        self.kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect()
    }

    /// Replay history from `from` grouped by revision.
    fn replay(&self, prefix: &str, from: Revision) -> Vec<WatchBatch> {
        let mut batches: Vec<WatchBatch> = Vec::new();
        for (rev, event) in self.history.iter().filter(|(rev, _)| *rev >= from) {
            if !event.kv.key.starts_with(prefix) {
                continue;
            }
            match batches.last_mut() {
                Some(batch) if batch.revision == *rev => batch.events.push(event.clone()),
                _ => batches.push(WatchBatch {
                    revision: *rev,
                    events: vec![event.clone()],
                }),
            }
        }
        batches
    }
}

fn delete_event(prev: KeyValue, revision: Revision) -> WatchEvent {
    WatchEvent {
        kind: EventType::Delete,
        kv: KeyValue {
            key: prev.key.clone(),
            value: String::new(),
            lease: None,
            create_revision: 0,
            mod_revision: revision,
        },
        prev_kv: Some(prev),
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// Shared in-memory store, hands out independent clients
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    next_client: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Create a store with the default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store, the lease reaper runs when a Tokio runtime is available
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        let state = Arc::new(Mutex::new(State::new(config.history_limit.max(1))));

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap_leases(Arc::downgrade(&state), config.reaper_interval));
        }

        Self {
            state,
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new connection
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            id: self.next_client.fetch_add(1, Ordering::Relaxed),
            connected: Arc::new(AtomicBool::new(true)),
            store: self.clone(),
        }
    }

    /// Current revision
    pub fn revision(&self) -> Revision {
        lock(&self.state).revision
    }

    /// All live keys with the prefix
    pub fn kvs(&self, prefix: &str) -> Vec<KeyValue> {
        let mut state = lock(&self.state);
        state.expire_leases(Instant::now());
        state.prefix_kvs(prefix)
    }

    /// Look up a single key
    pub fn get(&self, key: &str) -> Option<KeyValue> {
        let mut state = lock(&self.state);
        state.expire_leases(Instant::now());
        state.kvs.get(key).cloned()
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.expire_leases(Instant::now());
        state.leases.len()
    }

    /// Drop watch history up to and including `revision`
    pub fn compact(&self, revision: Revision) {
        let mut state = lock(&self.state);
        let revision = revision.min(state.revision);
        while state
            .history
            .front()
            .is_some_and(|(rev, _)| *rev <= revision)
        {
            state.history.pop_front();
        }
        state.compacted = state.compacted.max(revision);
        debug!(revision, "compacted history");
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn reap_leases(state: Weak<Mutex<State>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            return;
        };
        lock(&state).expire_leases(Instant::now());
    }
}

// ============================================================================
// Memory Client
// ============================================================================

/// One connection to a [`MemoryStore`]
///
/// A disconnected client fails every operation with
/// [`StoreError::Unavailable`] and its open watches end with the same error.
#[derive(Clone)]
pub struct MemoryClient {
    id: u64,
    connected: Arc<AtomicBool>,
    store: MemoryStore,
}

impl MemoryClient {
    /// Store this client is connected to
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Cut the connection, open watches are terminated
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut state = lock(&self.store.state);
        state.watchers.retain(|watcher| {
            if watcher.client != self.id {
                return true;
            }
            let _ = watcher.tx.send(Err(StoreError::Unavailable));
            false
        });
        debug!(client = self.id, "client disconnected");
    }

    /// Restore the connection
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        debug!(client = self.id, "client reconnected");
    }

    /// Lock the shared state after checking connectivity and expiring leases.
    fn state(&self) -> StoreResult<std::sync::MutexGuard<'_, State>> {
        if !self.is_connected() {
            return Err(StoreError::Unavailable);
        }
        let mut state = lock(&self.store.state);
        state.expire_leases(Instant::now());
        Ok(state)
    }
}

#[async_trait]
impl CoordinationStore for MemoryClient {
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut state = self.state()?;
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        trace!(lease = id, ttl_ms = ttl.as_millis() as u64, "lease granted");
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<()> {
        let mut state = self.state()?;
        let lease_state = state
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        lease_state.deadline = Instant::now() + lease_state.ttl;
        Ok(())
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut state = self.state()?;
        if state.revoke_lease(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<Revision> {
        let mut state = self.state()?;
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }

        let revision = state.revision + 1;
        let prev = state.kvs.get(key).cloned();
        if let Some(prev) = &prev {
            state.detach_from_lease(prev);
        }
        if let Some(l) = lease.and_then(|id| state.leases.get_mut(&id)) {
            l.keys.insert(key.to_string());
        }

        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            lease,
            create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
        };
        let kind = if prev.is_some() {
            EventType::Update
        } else {
            EventType::Create
        };

        state.kvs.insert(key.to_string(), kv.clone());
        state.revision = revision;
        state.commit(
            revision,
            vec![WatchEvent {
                kind,
                kv,
                prev_kv: prev,
            }],
        );
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let mut state = self.state()?;
        let Some(prev) = state.kvs.remove(key) else {
            return Ok(None);
        };
        state.detach_from_lease(&prev);

        let revision = state.revision + 1;
        state.revision = revision;
        state.commit(revision, vec![delete_event(prev.clone(), revision)]);
        Ok(Some(prev))
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Snapshot> {
        let state = self.state()?;
        Ok(Snapshot {
            revision: state.revision,
            kvs: state.prefix_kvs(prefix),
        })
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> StoreResult<WatchReceiver> {
        let mut state = self.state()?;
        if from_revision <= state.compacted {
            return Err(StoreError::Compacted {
                requested: from_revision,
                compacted: state.compacted,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for batch in state.replay(prefix, from_revision) {
            let _ = tx.send(Ok(batch));
        }
        state.watchers.push(Watcher {
            client: self.id,
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}
