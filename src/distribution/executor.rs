//! Restart-on-change supervision
//!
//! An executor, or a work, is a caller callback whose result depends on the
//! current ownership assignment. The supervisor restarts it whenever that
//! assignment may have changed:
//!
//! - on start (`reset: initialization`)
//! - when the node's listener delivers membership changes (`reset: distribution changed`)
//! - periodically (`reset: periodical`), recovering work stuck on a failed peer
//!
//! Every run gets a frozen [`Assigner`] snapshot through its [`RunContext`].
//! Before a new run starts, the previous one is cancelled and all tasks it
//! spawned through its context are awaited, so runs never overlap.
//!
//! ```text
//! Initializing ──► Running ──► ResetPending ──► Running ──► ... ──► Stopped
//! ```
//!
//! A failed first run is returned to the caller; a failed later run is logged
//! and retried on the next trigger.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument, Span};

use super::assigner::Assigner;
use super::config::ExecutorConfig;
use super::listener::{Events, Listener, Listeners};
use crate::metrics;
use crate::utils::{lock, shutdown_requested};

/// Error type returned by supervised callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type Callback =
    Arc<dyn Fn(RunContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Lifecycle state of a supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Initializing,
    Running,
    ResetPending,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::ResetPending => write!(f, "reset pending"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ============================================================================
// Run Context
// ============================================================================

/// Handle given to one run of a supervised callback
#[derive(Clone)]
pub struct RunContext {
    name: Arc<str>,
    assigner: Arc<Assigner>,
    cancel: watch::Receiver<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ready: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl RunContext {
    /// Supervisor name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ownership snapshot taken when the run started
    pub fn assigner(&self) -> &Assigner {
        &self.assigner
    }

    /// Shared handle to the ownership snapshot
    pub fn assigner_arc(&self) -> Arc<Assigner> {
        Arc::clone(&self.assigner)
    }

    /// Check if the run was asked to stop
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolve once the run is asked to stop
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        shutdown_requested(&mut cancel).await;
    }

    /// Spawn a task belonging to this run, the next run starts only after it finished
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task.in_current_span());
        lock(&self.tasks).push(handle);
    }

    /// Mark a work as initialized while it keeps running
    pub fn ready(&self) {
        if let Some(tx) = lock(&self.ready).take() {
            let _ = tx.send(());
        }
    }

    fn is_ready(&self) -> bool {
        lock(&self.ready).is_none()
    }
}

/// A started run
struct Run {
    cancel: watch::Sender<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    context: RunContext,
}

impl Run {
    /// Cancel the run and wait for all its tasks
    async fn stop(self) {
        self.cancel.send_replace(true);
        loop {
            let handles = std::mem::take(&mut *lock(&self.tasks));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    warn!(error = %err, "run task failed");
                }
            }
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// The callback initializes and spawns its workers through the context
    Executor,
    /// The callback future is the run itself
    Work,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executor => write!(f, "executor"),
            Self::Work => write!(f, "work"),
        }
    }
}

/// Why a run is restarted
#[derive(Debug, Clone)]
pub enum ResetReason {
    Initialization,
    Periodical,
    DistributionChanged(Events),
    ListenerEvicted,
    Shutdown,
}

impl ResetReason {
    /// Metrics label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::Periodical => "periodical",
            Self::DistributionChanged(_) => "distribution_changed",
            Self::ListenerEvicted => "listener_evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization => write!(f, "initialization"),
            Self::Periodical => write!(f, "periodical"),
            Self::DistributionChanged(events) => write!(f, "distribution changed: {events}"),
            Self::ListenerEvicted => write!(f, "listener evicted, resubscribed"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

pub(crate) struct Supervisor {
    pub(crate) name: String,
    pub(crate) node_id: String,
    pub(crate) kind: Kind,
    pub(crate) callback: Callback,
    pub(crate) config: ExecutorConfig,
    pub(crate) assigner: Arc<Mutex<Assigner>>,
    pub(crate) listeners: Listeners,
    pub(crate) listener: Listener,
    pub(crate) state: Arc<Mutex<SupervisorState>>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    /// Perform the first run and hand the supervisor over to a background task.
    pub(crate) async fn start(self, span: Span) -> Result<JoinHandle<()>, BoxError> {
        async move {
            info!("reset: {}", ResetReason::Initialization);
            self.record_reset(&ResetReason::Initialization);
            let run = self.start_run().await?;
            self.set_state(SupervisorState::Running);
            Ok(tokio::spawn(self.supervise(run).in_current_span()))
        }
        .instrument(span)
        .await
    }

    async fn supervise(mut self, first: Run) {
        let period = self.config.reset_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current = Some(first);

        loop {
            let reason = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => ResetReason::Shutdown,
                batch = self.listener.recv() => match batch {
                    Some(events) => ResetReason::DistributionChanged(self.coalesce(events)),
                    None if *self.shutdown.borrow() => ResetReason::Shutdown,
                    None => {
                        self.listener = self.listeners.add();
                        ResetReason::ListenerEvicted
                    }
                },
                _ = ticker.tick() => ResetReason::Periodical,
            };

            info!("reset: {reason}");
            self.record_reset(&reason);
            self.set_state(SupervisorState::ResetPending);
            if let Some(run) = current.take() {
                run.stop().await;
            }

            if matches!(reason, ResetReason::Shutdown) {
                break;
            }

            match self.start_run().await {
                Ok(run) => {
                    current = Some(run);
                    self.set_state(SupervisorState::Running);
                }
                Err(err) => {
                    error!(error = %err, "{} reset failed, retrying on the next trigger", self.kind);
                    metrics::record_supervisor_restart_error(&self.node_id, &self.name);
                }
            }
            ticker.reset();
        }

        self.set_state(SupervisorState::Stopped);
        info!("{} stopped", self.kind);
    }

    /// Merge batches queued during the previous reset into one trigger.
    fn coalesce(&mut self, first: Events) -> Events {
        let mut events = first.into_inner();
        while let Some(more) = self.listener.try_recv() {
            events.extend(more.into_inner());
        }
        Events::new(events)
    }

    async fn start_run(&self) -> Result<Run, BoxError> {
        let snapshot = Arc::new(lock(&self.assigner).clone());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let tasks = Arc::new(Mutex::new(Vec::new()));

        let context = RunContext {
            name: Arc::from(self.name.as_str()),
            assigner: snapshot,
            cancel: cancel_rx,
            tasks: Arc::clone(&tasks),
            ready: Arc::new(Mutex::new(Some(ready_tx))),
        };
        let run = Run {
            cancel: cancel_tx,
            tasks,
            context: context.clone(),
        };

        let started = match self.kind {
            Kind::Executor => (self.callback)(context).await,
            Kind::Work => self.start_work(context, ready_rx).await,
        };

        match started {
            Ok(()) => {
                debug!(nodes = run.context.assigner.node_count(), "{} started", self.kind);
                Ok(run)
            }
            Err(err) => {
                run.stop().await;
                Err(err)
            }
        }
    }

    /// Spawn the work future, it counts as started once it is ready or finished.
    async fn start_work(
        &self,
        context: RunContext,
        ready: oneshot::Receiver<()>,
    ) -> Result<(), BoxError> {
        let (done_tx, done_rx) = oneshot::channel();
        let work = (self.callback)(context.clone());
        let observer = context.clone();
        context.spawn(async move {
            let result = work.await;
            if let Err(err) = &result {
                if observer.is_ready() {
                    warn!(error = %err, "work finished with error");
                }
            }
            let _ = done_tx.send(result);
        });

        tokio::select! {
            biased;
            done = done_rx => match done {
                Ok(result) => result,
                Err(_) => Err("work task panicked".into()),
            },
            _ = ready => Ok(()),
        }
    }

    fn set_state(&self, state: SupervisorState) {
        *lock(&self.state) = state;
    }

    fn record_reset(&self, reason: &ResetReason) {
        metrics::record_supervisor_reset(&self.node_id, &self.name, reason.label());
    }
}

/// Box a callback so executors and works share one supervisor.
pub(crate) fn boxed<F, Fut>(callback: F) -> Callback
where
    F: Fn(RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |context| -> BoxFuture<'static, Result<(), BoxError>> {
        Box::pin(callback(context))
    })
}
