//! Distribution node
//!
//! A [`Node`] registers itself in the coordination store under a lease,
//! watches the registrations of its group and keeps its [`Assigner`] in sync
//! with them. Ownership questions are answered locally from that ring.
//!
//! # Startup
//!
//! 1. create a lease session
//! 2. write the registration record under the lease
//! 3. load all registrations and watch for changes
//! 4. wait until the node observed its own record through the watch
//!
//! Steps 1 to 3 are bounded by the startup timeout, step 4 by the
//! self-discovery timeout. Changes observed during startup are not reported
//! to listeners.
//!
//! # Shutdown
//!
//! The watch stops first, then the record is deleted explicitly and the
//! lease is revoked. If the explicit delete fails, the revoke or the lease
//! expiry removes the record anyway.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::assigner::Assigner;
use super::config::{ExecutorConfig, NodeConfig};
use super::error::{DistributionError, DistributionResult};
use super::executor::{boxed, BoxError, Callback, Kind, RunContext, Supervisor, SupervisorState};
use super::listener::{Event, EventType, Listener, Listeners};
use crate::metrics;
use crate::store::{
    get_all_and_watch, with_timeout, CoordinationStore, EventType as StoreEventType, KeyValue,
    LeaseId, Session, SessionEvent, StoreError, WatchEvent, WatchMessage,
};
use crate::utils::retry::{with_retry_if, RetryConfig};
use crate::utils::{lock, shutdown_requested};

/// A member of a worker fleet
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    node_id: String,
    config: NodeConfig,
    span: Span,
    store: Arc<dyn CoordinationStore>,
    key: String,
    assigner: Arc<Mutex<Assigner>>,
    listeners: Listeners,
    session: Session,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    states: Mutex<BTreeMap<String, Arc<Mutex<SupervisorState>>>>,
    stopped: tokio::sync::Mutex<bool>,
}

#[derive(Debug, Clone, Default)]
struct StartupStatus {
    synced: bool,
    discovered: bool,
    failed: Option<StoreError>,
}

impl Node {
    /// Start a node and wait until it is a visible member of its group
    pub async fn new(
        node_id: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        config: NodeConfig,
    ) -> DistributionResult<Self> {
        let node_id = node_id.into();
        if node_id.is_empty() || node_id.contains('/') {
            return Err(DistributionError::invalid_config(
                "node_id",
                "must be a non-empty name without '/'",
            ));
        }
        config.validate()?;

        let span = info_span!("distribution", node_id = %node_id, group = %config.group);
        Self::start(node_id, store, config, span.clone())
            .instrument(span)
            .await
    }

    async fn start(
        node_id: String,
        store: Arc<dyn CoordinationStore>,
        config: NodeConfig,
        span: Span,
    ) -> DistributionResult<Self> {
        info!("node ID \"{node_id}\"");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let assigner = Arc::new(Mutex::new(Assigner::new(node_id.clone())));
        let listeners = Listeners::new(
            node_id.clone(),
            config.events_group_interval,
            config.listener_buffer,
        );
        let prefix = config.nodes_prefix();
        let key = format!("{prefix}{node_id}");
        let (status_tx, mut status_rx) = watch::channel(StartupStatus::default());

        let startup = async {
            let (session, session_events) =
                Session::start(Arc::clone(&store), config.session_config()).await?;
            register(
                store.as_ref(),
                &key,
                &node_id,
                session.lease(),
                &config.registration_retry,
            )
            .await?;

            info!("watching for other nodes");
            let (watch_rx, watch_handle) = get_all_and_watch(
                Arc::clone(&store),
                prefix.clone(),
                config.watch_retry.clone(),
                shutdown_rx.clone(),
            );
            let membership = Membership {
                node_id: node_id.clone(),
                prefix: prefix.clone(),
                assigner: Arc::clone(&assigner),
                listeners: listeners.clone(),
                status: status_tx,
            };
            let loop_handle = tokio::spawn(membership.run(watch_rx).in_current_span());

            let status = status_rx
                .wait_for(|s| s.synced || s.failed.is_some())
                .await
                .map(|s| s.clone())
                .map_err(|_| StoreError::Closed)?;
            if let Some(err) = status.failed {
                return Err(DistributionError::Store(err));
            }

            Ok::<_, DistributionError>((session, session_events, vec![watch_handle, loop_handle]))
        };

        let (session, session_events, mut tasks) =
            match tokio::time::timeout(config.startup_timeout, startup).await {
                Ok(Ok(started)) => started,
                Ok(Err(err)) => {
                    shutdown.send_replace(true);
                    error!(error = %err, "cannot start the node");
                    return Err(err);
                }
                Err(_) => {
                    shutdown.send_replace(true);
                    error!(timeout = ?config.startup_timeout, "node startup timed out");
                    return Err(DistributionError::StartupTimeout(config.startup_timeout));
                }
            };

        if let Some(limit) = config.self_discovery_timeout {
            let discovered = matches!(
                tokio::time::timeout(limit, status_rx.wait_for(|s| s.discovered)).await,
                Ok(Ok(_))
            );
            if !discovered {
                error!(timeout = ?limit, "the node did not discover itself");
                shutdown.send_replace(true);
                session.close().await;
                return Err(DistributionError::SelfDiscoveryTimeout {
                    node_id,
                    timeout: limit,
                });
            }
        }

        // Startup churn is not reported to listeners
        listeners.discard_pending();
        if let Some(handle) = listeners.start(shutdown_rx.clone()) {
            tasks.push(handle);
        }

        let registrar = Registrar {
            node_id: node_id.clone(),
            key: key.clone(),
            store: Arc::clone(&store),
            retry: config.session_retry.clone(),
            shutdown: shutdown_rx,
        };
        tasks.push(tokio::spawn(registrar.run(session_events).in_current_span()));

        debug!(nodes = ?lock(&assigner).nodes(), "node started");

        Ok(Self {
            inner: Arc::new(NodeInner {
                node_id,
                config,
                span,
                store,
                key,
                assigner,
                listeners,
                session,
                shutdown,
                tasks: Mutex::new(tasks),
                supervisors: Mutex::new(Vec::new()),
                states: Mutex::new(BTreeMap::new()),
                stopped: tokio::sync::Mutex::new(false),
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn group(&self) -> &str {
        &self.inner.config.group
    }

    /// Known nodes, sorted
    pub fn nodes(&self) -> Vec<String> {
        lock(&self.inner.assigner).nodes()
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        lock(&self.inner.assigner).has_node(node_id)
    }

    /// Node owning the key
    pub fn node_for(&self, key: &str) -> DistributionResult<String> {
        lock(&self.inner.assigner)
            .node_for(key)
            .map(str::to_string)
    }

    /// Node owning the key.
    ///
    /// # Panics
    ///
    /// Panics if no node is known.
    pub fn must_get_node_for(&self, key: &str) -> String {
        match self.node_for(key) {
            Ok(node) => node,
            Err(err) => panic!("cannot get node for key \"{key}\": {err}"),
        }
    }

    /// Check if this node owns the key
    pub fn is_owner(&self, key: &str) -> DistributionResult<bool> {
        lock(&self.inner.assigner).is_owner(key)
    }

    /// Check if this node owns the key.
    ///
    /// # Panics
    ///
    /// Panics if no node is known.
    pub fn must_check_is_owner(&self, key: &str) -> bool {
        self.must_get_node_for(key) == self.inner.node_id
    }

    /// Frozen copy of the current assignment
    pub fn clone_assigner(&self) -> Assigner {
        lock(&self.inner.assigner).clone()
    }

    /// Subscribe to membership changes
    pub fn on_change_listener(&self) -> Listener {
        self.inner.listeners.add()
    }

    /// State of the executor or work started under `name`
    pub fn supervisor_state(&self, name: &str) -> Option<SupervisorState> {
        lock(&self.inner.states)
            .get(name)
            .map(|state| *lock(state))
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Start an executor.
    ///
    /// The callback initializes the work of one run and spawns its long-running
    /// tasks through [`RunContext::spawn`]. It is called again after every
    /// reset. An error of the first call is returned.
    ///
    /// # Panics
    ///
    /// Panics if a supervisor named `name` was already started on this node.
    pub async fn start_executor<F, Fut>(
        &self,
        name: impl Into<String>,
        config: ExecutorConfig,
        callback: F,
    ) -> DistributionResult<()>
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.start_supervisor(name.into(), Kind::Executor, config, boxed(callback))
            .await
    }

    /// Start a work.
    ///
    /// The callback future is one run, it should finish once
    /// [`RunContext::cancelled`] resolves. The run counts as started when it
    /// calls [`RunContext::ready`] or finishes; an error before that point in
    /// the first run is returned.
    ///
    /// # Panics
    ///
    /// Panics if a supervisor named `name` was already started on this node.
    pub async fn start_work<F, Fut>(
        &self,
        name: impl Into<String>,
        config: ExecutorConfig,
        callback: F,
    ) -> DistributionResult<()>
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.start_supervisor(name.into(), Kind::Work, config, boxed(callback))
            .await
    }

    async fn start_supervisor(
        &self,
        name: String,
        kind: Kind,
        config: ExecutorConfig,
        callback: Callback,
    ) -> DistributionResult<()> {
        config.validate()?;
        if self.is_shutting_down() {
            return Err(DistributionError::ShuttingDown);
        }

        let inner = &self.inner;
        let state = Arc::new(Mutex::new(SupervisorState::Initializing));
        {
            let mut states = lock(&inner.states);
            if states.contains_key(&name) {
                drop(states);
                panic!("{kind} \"{name}\" is already started");
            }
            states.insert(name.clone(), Arc::clone(&state));
        }

        let supervisor = Supervisor {
            name: name.clone(),
            node_id: inner.node_id.clone(),
            kind,
            callback,
            config,
            assigner: Arc::clone(&inner.assigner),
            listeners: inner.listeners.clone(),
            listener: inner.listeners.add(),
            state,
            shutdown: inner.shutdown.subscribe(),
        };

        let span = info_span!(parent: &inner.span, "executor", name = %name);
        match supervisor.start(span).await {
            Ok(handle) => {
                lock(&inner.supervisors).push(handle);
                Ok(())
            }
            Err(err) => {
                lock(&inner.states).remove(&name);
                Err(DistributionError::Initialization {
                    name,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Leave the group and stop all supervisors, repeated calls wait for the first
    pub async fn shutdown(&self) {
        let inner = Arc::clone(&self.inner);
        let span = inner.span.clone();
        async move {
            let mut stopped = inner.stopped.lock().await;
            if *stopped {
                return;
            }

            info!("received shutdown request");
            inner.shutdown.send_replace(true);

            let tasks = std::mem::take(&mut *lock(&inner.tasks));
            await_all(tasks).await;
            inner.listeners.close();

            inner.unregister().await;
            inner.session.close().await;

            let supervisors = std::mem::take(&mut *lock(&inner.supervisors));
            await_all(supervisors).await;

            *stopped = true;
            info!("shutdown done");
        }
        .instrument(span)
        .await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
    }
}

impl NodeInner {
    async fn unregister(&self) {
        let node_id = &self.node_id;
        info!("unregistering the node \"{node_id}\"");
        match with_timeout(self.config.shutdown_timeout, self.store.delete(&self.key)).await {
            Ok(_) => info!("the node \"{node_id}\" unregistered"),
            Err(err) => warn!(
                error = %err,
                "cannot unregister the node \"{node_id}\", the record expires with the session"
            ),
        }
    }
}

async fn await_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "background task failed");
        }
    }
}

/// Write the registration record under the lease.
async fn register(
    store: &dyn CoordinationStore,
    key: &str,
    node_id: &str,
    lease: LeaseId,
    retry: &RetryConfig,
) -> DistributionResult<()> {
    info!("registering the node \"{node_id}\"");
    with_retry_if(
        retry,
        move || store.put(key, node_id, Some(lease)),
        StoreError::is_recoverable,
    )
    .await
    .map_err(|source| DistributionError::Registration {
        node_id: node_id.to_string(),
        source,
    })?;
    info!("the node \"{node_id}\" registered");
    Ok(())
}

// ============================================================================
// Membership
// ============================================================================

/// Applies registration changes to the assigner
struct Membership {
    node_id: String,
    prefix: String,
    assigner: Arc<Mutex<Assigner>>,
    listeners: Listeners,
    status: watch::Sender<StartupStatus>,
}

impl Membership {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<WatchMessage>) {
        let mut reload: Option<BTreeSet<String>> = None;

        while let Some(message) = rx.recv().await {
            match message {
                WatchMessage::InitError(err) => {
                    error!(error = %err, "cannot load nodes");
                    self.status.send_modify(|s| s.failed = Some(err));
                    return;
                }
                WatchMessage::Error(err) => {
                    warn!(error = %err, "watching nodes failed, retrying");
                }
                WatchMessage::Restarted { reason } => {
                    info!(%reason, "reloading nodes");
                    reload = Some(BTreeSet::new());
                }
                WatchMessage::Batch { events, .. } => match reload.as_mut() {
                    Some(ids) => ids.extend(
                        events
                            .iter()
                            .filter(|e| e.kind != StoreEventType::Delete)
                            .map(|e| self.node_id_of(&e.kv)),
                    ),
                    None => self.apply(&events),
                },
                WatchMessage::Synced { revision } => {
                    if let Some(ids) = reload.take() {
                        self.replace(ids);
                    }
                    debug!(revision, "nodes synced");
                    self.status.send_if_modified(|s| !std::mem::replace(&mut s.synced, true));
                }
            }
        }
    }

    fn node_id_of(&self, kv: &KeyValue) -> String {
        if !kv.value.is_empty() {
            return kv.value.clone();
        }
        kv.key
            .strip_prefix(&self.prefix)
            .unwrap_or(&kv.key)
            .to_string()
    }

    /// Apply incremental changes.
    fn apply(&self, events: &[WatchEvent]) {
        let mut changes = Vec::new();
        let count = {
            let mut assigner = lock(&self.assigner);
            for event in events {
                match event.kind {
                    StoreEventType::Create | StoreEventType::Update => {
                        let id = self.node_id_of(&event.kv);
                        if assigner.add_node(&id) {
                            info!("found a new node \"{id}\"");
                            changes.push(Event::added(id));
                        }
                    }
                    StoreEventType::Delete => {
                        let id = self.node_id_of(event.prev_kv.as_ref().unwrap_or(&event.kv));
                        if assigner.remove_node(&id) {
                            info!("the node \"{id}\" gone");
                            changes.push(Event::removed(id));
                        }
                    }
                }
            }
            assigner.node_count()
        };
        self.publish(changes, count);
    }

    /// Replace the ring with a reloaded set of nodes, reporting the difference.
    fn replace(&self, ids: BTreeSet<String>) {
        let mut changes = Vec::new();
        let count = {
            let mut assigner = lock(&self.assigner);
            let current: BTreeSet<String> = assigner.nodes().into_iter().collect();
            for id in current.difference(&ids) {
                info!("the node \"{id}\" gone");
                changes.push(Event::removed(id.clone()));
            }
            for id in ids.difference(&current) {
                info!("found a new node \"{id}\"");
                changes.push(Event::added(id.clone()));
            }
            assigner.reset_nodes();
            for id in &ids {
                assigner.add_node(id);
            }
            assigner.node_count()
        };
        self.publish(changes, count);
    }

    fn publish(&self, changes: Vec<Event>, count: usize) {
        metrics::set_known_nodes(&self.node_id, count);
        let added = changes
            .iter()
            .filter(|e| e.kind == EventType::NodeAdded)
            .count();
        metrics::record_membership_events(&self.node_id, "added", added);
        metrics::record_membership_events(&self.node_id, "removed", changes.len() - added);

        if changes
            .iter()
            .any(|e| e.kind == EventType::NodeAdded && e.node_id == self.node_id)
        {
            self.status.send_if_modified(|s| !std::mem::replace(&mut s.discovered, true));
        }
        self.listeners.notify(changes);
    }
}

// ============================================================================
// Registrar
// ============================================================================

/// Writes the registration record again whenever the session is re-created
struct Registrar {
    node_id: String,
    key: String,
    store: Arc<dyn CoordinationStore>,
    retry: RetryConfig,
    shutdown: watch::Receiver<bool>,
}

impl Registrar {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return,
                event = events.recv() => event,
            };

            match event {
                None => return,
                Some(SessionEvent::Lost(lease)) => {
                    metrics::record_session_event(&self.node_id, true);
                    warn!(lease, "session lost, the registration expired");
                }
                Some(SessionEvent::Created(lease)) => {
                    metrics::record_session_event(&self.node_id, false);
                    let registered = tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut self.shutdown) => return,
                        result = register(self.store.as_ref(), &self.key, &self.node_id, lease, &self.retry) => result,
                    };
                    if let Err(err) = registered {
                        error!(error = %err, "cannot register the node under the new session");
                    }
                }
            }
        }
    }
}
