//! Lease session
//!
//! A [`Session`] owns one lease and keeps it alive in a background task. The
//! owner never deals with reconnection: the task reports
//! [`SessionEvent::Lost`] when the lease is gone (revoked, expired, or not
//! renewed within its TTL) and [`SessionEvent::Created`] once a replacement
//! lease was granted. Keys must be written again under the new lease.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use super::{with_timeout, CoordinationStore, LeaseId, StoreError, StoreResult};
use crate::utils::retry::{Backoff, RetryConfig};
use crate::utils::{lock, shutdown_requested};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lease TTL, keep-alives are sent every third of it
    pub ttl: Duration,

    /// Deadline for a single grant, keep-alive or revoke call
    pub grant_timeout: Duration,

    /// Backoff between failed renewals and re-grants
    pub retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            grant_timeout: Duration::from_secs(5),
            retry: RetryConfig::background(),
        }
    }
}

/// Lease lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A replacement lease was granted
    Created(LeaseId),
    /// The lease is gone, keys bound to it were deleted by the store
    Lost(LeaseId),
}

/// Resilient lease keep-alive
pub struct Session {
    lease: Arc<AtomicI64>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Grant the first lease and start keeping it alive.
    ///
    /// Fails without retrying if the first lease cannot be granted within the
    /// grant timeout, callers decide whether a dead store is fatal.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        config: SessionConfig,
    ) -> StoreResult<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        info!("creating session");
        let lease = grant(store.as_ref(), &config).await?;
        info!(lease, "created session");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let current = Arc::new(AtomicI64::new(lease));

        let keeper = Keeper {
            store,
            backoff: Backoff::new(config.retry.clone()),
            config,
            lease: Some(lease),
            current: Arc::clone(&current),
            events: events_tx,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(keeper.run().instrument(tracing::Span::current()));

        Ok((
            Self {
                lease: current,
                shutdown,
                handle: Mutex::new(Some(handle)),
            },
            events_rx,
        ))
    }

    /// Most recently granted lease
    pub fn lease(&self) -> LeaseId {
        self.lease.load(Ordering::SeqCst)
    }

    /// Revoke the lease and stop the keep-alive task
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "session task failed");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn grant(store: &dyn CoordinationStore, config: &SessionConfig) -> StoreResult<LeaseId> {
    let lease = with_timeout(config.grant_timeout, store.grant(config.ttl)).await?;
    with_timeout(config.grant_timeout, store.keep_alive_once(lease)).await?;
    Ok(lease)
}

struct Keeper {
    store: Arc<dyn CoordinationStore>,
    config: SessionConfig,
    backoff: Backoff,
    lease: Option<LeaseId>,
    current: Arc<AtomicI64>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Keeper {
    async fn run(mut self) {
        let period = self.config.ttl / 3;
        let mut last_renewal = Instant::now();
        let mut delay = period;

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(lease) = self.lease else {
                delay = self.regrant().await;
                last_renewal = Instant::now();
                continue;
            };

            let result = with_timeout(
                self.config.grant_timeout,
                self.store.keep_alive_once(lease),
            )
            .await;

            match result {
                Ok(()) => {
                    last_renewal = Instant::now();
                    self.backoff.reset();
                    delay = period;
                }
                Err(err @ StoreError::LeaseNotFound(_)) => {
                    self.lost(lease, &err);
                    delay = Duration::ZERO;
                }
                Err(err) if last_renewal.elapsed() >= self.config.ttl => {
                    self.lost(lease, &err);
                    delay = Duration::ZERO;
                }
                Err(err) => {
                    delay = self.backoff.next_delay().min(period);
                    warn!(lease, error = %err, retry_in_ms = delay.as_millis() as u64, "keep-alive failed");
                }
            }
        }

        self.close().await;
    }

    fn lost(&mut self, lease: LeaseId, err: &StoreError) {
        warn!(lease, error = %err, "session lost");
        self.lease = None;
        self.backoff.reset();
        let _ = self.events.send(SessionEvent::Lost(lease));
    }

    /// Grant a replacement lease, returns the delay before the next attempt.
    async fn regrant(&mut self) -> Duration {
        match grant(self.store.as_ref(), &self.config).await {
            Ok(lease) => {
                info!(lease, "created session");
                self.lease = Some(lease);
                self.current.store(lease, Ordering::SeqCst);
                self.backoff.reset();
                let _ = self.events.send(SessionEvent::Created(lease));
                self.config.ttl / 3
            }
            Err(err) => {
                let delay = self.backoff.next_delay();
                debug!(error = %err, retry_in_ms = delay.as_millis() as u64, "cannot create session");
                delay
            }
        }
    }

    async fn close(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        info!(lease, "closing session");
        match with_timeout(self.config.grant_timeout, self.store.revoke(lease)).await {
            Ok(()) | Err(StoreError::LeaseNotFound(_)) => info!(lease, "closed session"),
            Err(err) => warn!(lease, error = %err, "cannot revoke lease, it expires after its TTL"),
        }
    }
}
