//! Membership change notifications
//!
//! The node's watch loop hands every membership change to [`Listeners`],
//! which buffers them and flushes the buffer once per events-group interval
//! as a single [`Events`] batch to every subscribed [`Listener`]. A burst of
//! changes within one interval therefore reaches subscribers as one batch.
//!
//! Delivery never blocks the watch loop: each listener has a bounded queue,
//! and a listener whose queue is full is evicted, its stream ends after the
//! already queued batches.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::metrics;
use crate::utils::{lock, shutdown_requested};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NodeAdded,
    NodeRemoved,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeAdded => write!(f, "added"),
            Self::NodeRemoved => write!(f, "removed"),
        }
    }
}

/// One membership transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: EventType,
    pub node_id: String,
    pub message: String,
}

impl Event {
    pub fn added(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            kind: EventType::NodeAdded,
            message: format!("found a new node \"{node_id}\""),
            node_id,
        }
    }

    pub fn removed(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            kind: EventType::NodeRemoved,
            message: format!("the node \"{node_id}\" gone"),
            node_id,
        }
    }
}

/// A batch of events delivered together
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Events(Vec<Event>);

impl Events {
    pub fn new(events: Vec<Event>) -> Self {
        Self(events)
    }

    /// Event messages joined into one line
    pub fn messages(&self) -> String {
        self.0
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn into_inner(self) -> Vec<Event> {
        self.0
    }
}

impl Deref for Events {
    type Target = [Event];

    fn deref(&self) -> &[Event] {
        &self.0
    }
}

impl fmt::Display for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.messages())
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Subscription to membership changes.
///
/// Dropping the listener, or calling [`Listener::stop`], unsubscribes it.
#[derive(Debug)]
pub struct Listener {
    id: u64,
    rx: mpsc::Receiver<Events>,
    registry: Weak<Registry>,
}

impl Listener {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next batch, `None` once the listener was stopped,
    /// evicted or the node shut down
    pub async fn recv(&mut self) -> Option<Events> {
        self.rx.recv().await
    }

    /// Take a queued batch without waiting
    pub fn try_recv(&mut self) -> Option<Events> {
        self.rx.try_recv().ok()
    }

    /// Unsubscribe, queued batches are discarded
    pub fn stop(self) {}
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

// ============================================================================
// Listeners Registry
// ============================================================================

#[derive(Debug)]
struct Registry {
    node_id: String,
    interval: Duration,
    buffer: usize,
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    pending: Vec<Event>,
    subscribers: BTreeMap<u64, mpsc::Sender<Events>>,
    next_id: u64,
    closed: bool,
}

impl Registry {
    fn remove(&self, id: u64) {
        if lock(&self.state).subscribers.remove(&id).is_some() {
            debug!(listener = id, "listener stopped");
        }
    }

    fn flush_locked(&self, state: &mut RegistryState) {
        if state.pending.is_empty() {
            return;
        }
        let batch = Events(std::mem::take(&mut state.pending));
        metrics::record_listener_batch(&self.node_id);

        state.subscribers.retain(|id, tx| match tx.try_send(batch.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(listener = *id, "listener evicted, its queue is full");
                metrics::record_listener_eviction(&self.node_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Registry of listeners owned by a node
#[derive(Debug, Clone)]
pub(crate) struct Listeners {
    inner: Arc<Registry>,
}

impl Listeners {
    pub(crate) fn new(node_id: impl Into<String>, interval: Duration, buffer: usize) -> Self {
        Self {
            inner: Arc::new(Registry {
                node_id: node_id.into(),
                interval,
                buffer: buffer.max(1),
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Start the periodic flush, not needed when events are delivered immediately
    pub(crate) fn start(&self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let period = self.inner.interval;
        if period.is_zero() {
            return None;
        }

        let listeners = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => return,
                    _ = ticker.tick() => listeners.flush(),
                }
            }
        });
        Some(handle)
    }

    /// Subscribe a new listener
    pub(crate) fn add(&self) -> Listener {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let mut state = lock(&self.inner.state);
        let id = state.next_id;
        state.next_id += 1;
        if !state.closed {
            state.subscribers.insert(id, tx);
        }
        Listener {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Queue events for the next flush
    pub(crate) fn notify(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut state = lock(&self.inner.state);
        if state.closed {
            return;
        }
        state.pending.extend(events);
        if self.inner.interval.is_zero() {
            self.inner.flush_locked(&mut state);
        }
    }

    /// Drop events that were not delivered yet
    pub(crate) fn discard_pending(&self) {
        lock(&self.inner.state).pending.clear();
    }

    /// Deliver pending events now
    pub(crate) fn flush(&self) {
        let mut state = lock(&self.inner.state);
        self.inner.flush_locked(&mut state);
    }

    /// Deliver pending events and end all listener streams
    pub(crate) fn close(&self) {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return;
        }
        self.inner.flush_locked(&mut state);
        state.closed = true;
        state.subscribers.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.inner.state).subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_ids(events: &Events) -> Vec<&str> {
        events.iter().map(|e| e.node_id.as_str()).collect()
    }

    #[test]
    fn test_event_messages() {
        let events = Events::new(vec![Event::added("node1"), Event::removed("node2")]);
        assert_eq!(
            events.messages(),
            "found a new node \"node1\", the node \"node2\" gone"
        );
        assert_eq!(events[0].kind, EventType::NodeAdded);
        assert_eq!(events[1].kind, EventType::NodeRemoved);
    }

    #[tokio::test]
    async fn test_immediate_delivery() {
        let listeners = Listeners::new("node1", Duration::ZERO, 8);
        let mut listener = listeners.add();

        listeners.notify(vec![Event::added("node1")]);
        listeners.notify(vec![Event::added("node2")]);

        assert_eq!(node_ids(&listener.recv().await.unwrap()), vec!["node1"]);
        assert_eq!(node_ids(&listener.recv().await.unwrap()), vec!["node2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_grouped_per_interval() {
        let listeners = Listeners::new("node1", Duration::from_secs(5), 8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let _handle = listeners.start(stop_rx).unwrap();

        let mut first = listeners.add();
        let mut second = listeners.add();
        listeners.notify(vec![Event::added("node1")]);
        listeners.notify(vec![Event::added("node2"), Event::added("node3")]);
        assert!(first.try_recv().is_none());

        let batch = first.recv().await.unwrap();
        assert_eq!(node_ids(&batch), vec!["node1", "node2", "node3"]);
        assert_eq!(second.recv().await.unwrap(), batch);
    }

    #[tokio::test]
    async fn test_nothing_delivered_without_events() {
        let listeners = Listeners::new("node1", Duration::from_secs(5), 8);
        let mut listener = listeners.add();
        listeners.flush();
        assert!(listener.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_discard_pending() {
        let listeners = Listeners::new("node1", Duration::from_secs(5), 8);
        let mut listener = listeners.add();

        listeners.notify(vec![Event::added("node1")]);
        listeners.discard_pending();
        listeners.flush();
        assert!(listener.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_stop_unsubscribes() {
        let listeners = Listeners::new("node1", Duration::ZERO, 8);
        let listener = listeners.add();
        let mut other = listeners.add();
        assert_eq!(listeners.len(), 2);

        listener.stop();
        assert_eq!(listeners.len(), 1);

        listeners.notify(vec![Event::removed("node2")]);
        assert!(other.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_slow_listener_evicted() {
        let listeners = Listeners::new("node1", Duration::ZERO, 1);
        let mut slow = listeners.add();
        let mut fast = listeners.add();

        listeners.notify(vec![Event::added("a")]);
        assert!(fast.recv().await.is_some());
        listeners.notify(vec![Event::added("b")]);
        assert!(fast.recv().await.is_some());

        assert_eq!(listeners.len(), 1);
        assert_eq!(node_ids(&slow.recv().await.unwrap()), vec!["a"]);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_flushes_and_ends_streams() {
        let listeners = Listeners::new("node1", Duration::from_secs(60), 8);
        let mut listener = listeners.add();

        listeners.notify(vec![Event::removed("node2")]);
        listeners.close();

        assert_eq!(node_ids(&listener.recv().await.unwrap()), vec!["node2"]);
        assert!(listener.recv().await.is_none());

        let mut late = listeners.add();
        assert!(late.recv().await.is_none());
    }
}
