//! Get-all-then-watch stream
//!
//! Loads a consistent snapshot of a prefix, delivers it as a burst of
//! `Create` events and then watches the prefix from the snapshot revision, so
//! no modification falls between the two. If the store has compacted the
//! revision the watch needs, the stream starts over from a fresh snapshot and
//! announces it with [`WatchMessage::Restarted`].

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use super::{CoordinationStore, EventType, KeyValue, Revision, StoreError, WatchEvent};
use crate::utils::retry::{Backoff, RetryConfig};
use crate::utils::shutdown_requested;

/// Snapshot events are delivered in batches of this size
pub const SNAPSHOT_BATCH_SIZE: usize = 100;

/// Item of a get-all-then-watch stream
#[derive(Debug, Clone)]
pub enum WatchMessage {
    /// The stream starts over, the following batches up to `Synced` are a full snapshot
    Restarted { reason: String },

    /// Events of one revision, or one chunk of a snapshot
    Batch {
        revision: Revision,
        events: Vec<WatchEvent>,
    },

    /// The snapshot was delivered completely, incremental events follow
    Synced { revision: Revision },

    /// The first snapshot could not be loaded, the stream ends
    InitError(StoreError),

    /// A transient error, the stream retries with backoff
    Error(StoreError),
}

/// Why incremental watching stopped
enum Interrupt {
    Shutdown,
    Restart(String),
}

/// Start a get-all-then-watch stream over `prefix`.
///
/// The stream ends after shutdown, after an [`WatchMessage::InitError`] or
/// when the receiver is dropped.
pub fn get_all_and_watch(
    store: Arc<dyn CoordinationStore>,
    prefix: impl Into<String>,
    retry: RetryConfig,
    shutdown: watch::Receiver<bool>,
) -> (mpsc::UnboundedReceiver<WatchMessage>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = WatchStream {
        store,
        prefix: prefix.into(),
        backoff: Backoff::new(retry),
        shutdown,
        tx,
    };
    let handle = tokio::spawn(stream.run().in_current_span());
    (rx, handle)
}

struct WatchStream {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    backoff: Backoff,
    shutdown: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<WatchMessage>,
}

impl WatchStream {
    async fn run(mut self) {
        let mut initialized = false;
        let mut restart_reason: Option<String> = None;

        loop {
            let snapshot = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return,
                result = self.store.get_prefix(&self.prefix) => result,
            };

            let snapshot = match snapshot {
                Ok(snapshot) => snapshot,
                Err(err) if !initialized => {
                    let _ = self.tx.send(WatchMessage::InitError(err));
                    return;
                }
                Err(err) => {
                    warn!(prefix = %self.prefix, error = %err, "cannot load snapshot");
                    if !self.emit(WatchMessage::Error(err)) || !self.pause().await {
                        return;
                    }
                    continue;
                }
            };

            if let Some(reason) = restart_reason.take() {
                if !self.emit(WatchMessage::Restarted { reason }) {
                    return;
                }
            }
            if !self.emit_snapshot(snapshot.revision, snapshot.kvs) {
                return;
            }
            initialized = true;

            match self.watch_from(snapshot.revision + 1).await {
                Interrupt::Shutdown => return,
                Interrupt::Restart(reason) => {
                    debug!(prefix = %self.prefix, %reason, "restarting watch");
                    restart_reason = Some(reason);
                }
            }
        }
    }

    /// Watch incrementally until shutdown or until a restart is required.
    async fn watch_from(&mut self, mut next: Revision) -> Interrupt {
        loop {
            if let Some(interrupt) = self.watch_once(&mut next).await {
                return interrupt;
            }
            if !self.pause().await {
                return Interrupt::Shutdown;
            }
        }
    }

    /// One watch attempt, `None` means it failed transiently and is retried.
    async fn watch_once(&mut self, next: &mut Revision) -> Option<Interrupt> {
        let opened = tokio::select! {
            _ = shutdown_requested(&mut self.shutdown) => return Some(Interrupt::Shutdown),
            result = self.store.watch_prefix(&self.prefix, *next) => result,
        };

        let mut rx = match opened {
            Ok(rx) => rx,
            Err(err @ StoreError::Compacted { .. }) => {
                return Some(Interrupt::Restart(err.to_string()));
            }
            Err(err) => {
                warn!(prefix = %self.prefix, error = %err, "cannot open watch");
                return self.error(err);
            }
        };
        self.backoff.reset();

        loop {
            let item = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return Some(Interrupt::Shutdown),
                item = rx.recv() => item,
            };

            match item {
                Some(Ok(batch)) => {
                    *next = batch.revision + 1;
                    let message = WatchMessage::Batch {
                        revision: batch.revision,
                        events: batch.events,
                    };
                    if !self.emit(message) {
                        return Some(Interrupt::Shutdown);
                    }
                }
                Some(Err(err @ StoreError::Compacted { .. })) => {
                    return Some(Interrupt::Restart(err.to_string()));
                }
                Some(Err(err)) => {
                    warn!(prefix = %self.prefix, error = %err, "watch interrupted");
                    return self.error(err);
                }
                None => {
                    warn!(prefix = %self.prefix, "watch closed by the store");
                    return self.error(StoreError::Closed);
                }
            }
        }
    }

    fn emit_snapshot(&self, revision: Revision, kvs: Vec<KeyValue>) -> bool {
        let events: Vec<WatchEvent> = kvs
            .into_iter()
            .map(|kv| WatchEvent {
                kind: EventType::Create,
                kv,
                prev_kv: None,
            })
            .collect();

        let empty = WatchMessage::Batch {
            revision,
            events: Vec::new(),
        };
        if events.is_empty() && !self.emit(empty) {
            return false;
        }
        for chunk in events.chunks(SNAPSHOT_BATCH_SIZE) {
            if !self.emit(WatchMessage::Batch {
                revision,
                events: chunk.to_vec(),
            }) {
                return false;
            }
        }
        self.emit(WatchMessage::Synced { revision })
    }

    fn error(&self, err: StoreError) -> Option<Interrupt> {
        if self.emit(WatchMessage::Error(err)) {
            None
        } else {
            Some(Interrupt::Shutdown)
        }
    }

    fn emit(&self, message: WatchMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Sleep before the next attempt, false on shutdown.
    async fn pause(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        tokio::select! {
            _ = shutdown_requested(&mut self.shutdown) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
