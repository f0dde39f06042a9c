//! etcd coordination store
//!
//! Implements [`CoordinationStore`] on top of an etcd v3 cluster, so nodes in
//! different processes and hosts share one membership view. Leases, prefix
//! reads and watches map directly to the etcd API; compacted watch revisions
//! surface as [`StoreError::Compacted`].

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType as EtcdEventType, GetOptions, PutOptions,
    WatchOptions, WatchStream, Watcher,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    CoordinationStore, EventType, KeyValue, LeaseId, Revision, Snapshot, StoreError, StoreResult,
    WatchBatch, WatchEvent, WatchReceiver,
};

/// etcd connection settings
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Cluster endpoints, e.g. `http://127.0.0.1:2379`
    pub endpoints: Vec<String>,

    /// Timeout of establishing the connection
    pub connect_timeout: Duration,

    /// Timeout of a single request
    pub request_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![String::from("http://127.0.0.1:2379")],
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Store client connected to an etcd cluster
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the cluster
    pub async fn connect(config: &EtcdConfig) -> StoreResult<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout)
            .with_timeout(config.request_timeout);

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| {
                warn!(endpoints = ?config.endpoints, error = %e, "cannot connect to etcd");
                StoreError::Unavailable
            })?;

        info!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(Self { client })
    }
}

/// Map a client error, lease errors are reported by the server as a status message.
fn store_error(err: etcd_client::Error, lease: Option<LeaseId>) -> StoreError {
    if let (Some(id), etcd_client::Error::GRpcStatus(status)) = (lease, &err) {
        if lease_missing(status.message()) {
            return StoreError::LeaseNotFound(id);
        }
    }
    debug!(error = %err, "etcd request failed");
    StoreError::Unavailable
}

fn lease_missing(message: &str) -> bool {
    message.contains("requested lease not found")
}

fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

fn key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: String::from_utf8_lossy(kv.value()).into_owned(),
        lease: (kv.lease() != 0).then_some(kv.lease()),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
    }
}

/// Puts of a key that did not exist before are creates.
fn put_kind(kv: &KeyValue) -> EventType {
    if kv.create_revision == kv.mod_revision {
        EventType::Create
    } else {
        EventType::Update
    }
}

fn watch_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    let kv = key_value(event.kv()?);
    let prev_kv = event.prev_kv().map(key_value);
    let kind = match event.event_type() {
        EtcdEventType::Put => put_kind(&kv),
        EtcdEventType::Delete => EventType::Delete,
    };
    Some(WatchEvent { kind, kv, prev_kv })
}

/// Split a watch response into batches of one revision each.
fn batches(events: Vec<WatchEvent>) -> Vec<WatchBatch> {
    let mut out: Vec<WatchBatch> = Vec::new();
    for event in events {
        let revision = event.kv.mod_revision;
        match out.last_mut() {
            Some(batch) if batch.revision == revision => batch.events.push(event),
            _ => out.push(WatchBatch {
                revision,
                events: vec![event],
            }),
        }
    }
    out
}

/// Forward a watch stream until the receiver is dropped or the watch ends.
async fn forward_watch(
    mut watcher: Watcher,
    mut stream: WatchStream,
    from_revision: Revision,
    tx: mpsc::UnboundedSender<StoreResult<WatchBatch>>,
) {
    loop {
        let message = tokio::select! {
            _ = tx.closed() => break,
            message = stream.message() => message,
        };

        match message {
            Ok(Some(response)) => {
                if response.compact_revision() > 0 {
                    let _ = tx.send(Err(StoreError::Compacted {
                        requested: from_revision,
                        compacted: response.compact_revision(),
                    }));
                    break;
                }
                if response.canceled() {
                    debug!(watch_id = response.watch_id(), "etcd watch canceled");
                    let _ = tx.send(Err(StoreError::Closed));
                    break;
                }

                let events = response.events().iter().filter_map(watch_event).collect();
                for batch in batches(events) {
                    if tx.send(Ok(batch)).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => {
                let _ = tx.send(Err(StoreError::Closed));
                break;
            }
            Err(e) => {
                warn!(error = %e, "etcd watch failed");
                let _ = tx.send(Err(StoreError::Unavailable));
                break;
            }
        }
    }

    if let Err(e) = watcher.cancel().await {
        debug!(error = %e, "cannot cancel etcd watch");
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut client = self.client.clone();
        let response = client
            .lease_grant(ttl_secs(ttl), None)
            .await
            .map_err(|e| store_error(e, None))?;
        Ok(response.id())
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| store_error(e, Some(lease)))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| store_error(e, Some(lease)))?;

        match stream.message().await {
            // A zero TTL means the lease no longer exists
            Ok(Some(response)) if response.ttl() > 0 => Ok(()),
            Ok(Some(_)) => Err(StoreError::LeaseNotFound(lease)),
            Ok(None) => Err(StoreError::Closed),
            Err(e) => Err(store_error(e, Some(lease))),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease)
            .await
            .map_err(|e| store_error(e, Some(lease)))?;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> StoreResult<Revision> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let response = client
            .put(key, value, options)
            .await
            .map_err(|e| store_error(e, lease))?;
        Ok(response.header().map_or(0, |h| h.revision()))
    }

    async fn delete(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let mut client = self.client.clone();
        let response = client
            .delete(key, Some(DeleteOptions::new().with_prev_key()))
            .await
            .map_err(|e| store_error(e, None))?;
        Ok(response.prev_kvs().first().map(key_value))
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Snapshot> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| store_error(e, None))?;

        Ok(Snapshot {
            revision: response.header().map_or(0, |h| h.revision()),
            kvs: response.kvs().iter().map(key_value).collect(),
        })
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> StoreResult<WatchReceiver> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_revision)
            .with_prev_key();
        let (watcher, stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(|e| store_error(e, None))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_watch(watcher, stream, from_revision, tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, create: Revision, modified: Revision) -> WatchEvent {
        let kv = KeyValue {
            key: key.to_string(),
            value: key.to_string(),
            lease: Some(7),
            create_revision: create,
            mod_revision: modified,
        };
        WatchEvent {
            kind: put_kind(&kv),
            kv,
            prev_kv: None,
        }
    }

    #[test]
    fn test_put_kind() {
        assert_eq!(put("a", 5, 5).kind, EventType::Create);
        assert_eq!(put("a", 5, 9).kind, EventType::Update);
    }

    #[test]
    fn test_batches_split_by_revision() {
        let grouped = batches(vec![
            put("a", 3, 3),
            put("b", 3, 3),
            put("c", 4, 4),
            put("a", 3, 6),
        ]);

        let revisions: Vec<Revision> = grouped.iter().map(|b| b.revision).collect();
        assert_eq!(revisions, vec![3, 4, 6]);
        assert_eq!(grouped[0].events.len(), 2);
        assert_eq!(grouped[2].events[0].kind, EventType::Update);
        assert!(batches(Vec::new()).is_empty());
    }

    #[test]
    fn test_ttl_rounds_up_to_seconds() {
        assert_eq!(ttl_secs(Duration::from_secs(15)), 15);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_lease_missing_message() {
        assert!(lease_missing("etcdserver: requested lease not found"));
        assert!(!lease_missing("etcdserver: request timed out"));
    }

    #[test]
    fn test_default_config() {
        let config = EtcdConfig::default();
        assert_eq!(config.endpoints, vec!["http://127.0.0.1:2379"]);
        assert!(config.request_timeout > config.connect_timeout);
    }
}
