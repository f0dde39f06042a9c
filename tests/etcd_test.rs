//! Integration tests against a real etcd cluster
//!
//! Skipped unless `FLEETDIST_TEST_ETCD_ENDPOINTS` points at a running cluster,
//! e.g. `FLEETDIST_TEST_ETCD_ENDPOINTS=http://127.0.0.1:2379 cargo test --test etcd_test`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, test_config};
use fleetdist::distribution::{Node, NodeConfig};
use fleetdist::store::{CoordinationStore, EtcdConfig, EtcdStore, StoreError};
use uuid::Uuid;

async fn connect() -> Option<EtcdStore> {
    let endpoints = std::env::var("FLEETDIST_TEST_ETCD_ENDPOINTS").ok()?;
    let config = EtcdConfig {
        endpoints: endpoints.split(',').map(String::from).collect(),
        ..EtcdConfig::default()
    };
    Some(EtcdStore::connect(&config).await.expect("etcd should be reachable"))
}

/// Unique group so runs do not see each other's leftovers
fn isolated_config() -> NodeConfig {
    let group = format!("test-{}", Uuid::new_v4().simple());
    NodeConfig {
        group,
        ..test_config()
    }
}

#[tokio::test]
async fn test_etcd_lease_lifecycle() {
    let Some(store) = connect().await else {
        return;
    };
    let key = format!("fleetdist-test/{}", Uuid::new_v4().simple());

    let lease = store.grant(Duration::from_secs(5)).await.unwrap();
    store.keep_alive_once(lease).await.unwrap();
    store.put(&key, "v1", Some(lease)).await.unwrap();

    let snapshot = store.get_prefix(&key).await.unwrap();
    assert_eq!(snapshot.kvs.len(), 1);
    assert_eq!(snapshot.kvs[0].lease, Some(lease));
    assert!(snapshot.revision >= snapshot.kvs[0].mod_revision);

    store.revoke(lease).await.unwrap();
    assert!(store.get_prefix(&key).await.unwrap().kvs.is_empty());
    assert_eq!(
        store.keep_alive_once(lease).await,
        Err(StoreError::LeaseNotFound(lease))
    );
}

#[tokio::test]
async fn test_etcd_watch_reports_deletes() {
    let Some(store) = connect().await else {
        return;
    };
    let prefix = format!("fleetdist-test/{}/", Uuid::new_v4().simple());
    let key = format!("{prefix}a");

    let start = store.get_prefix(&prefix).await.unwrap().revision + 1;
    let mut rx = store.watch_prefix(&prefix, start).await.unwrap();

    store.put(&key, "a", None).await.unwrap();
    let prev = store.delete(&key).await.unwrap();
    assert_eq!(prev.map(|kv| kv.value), Some("a".to_string()));

    let created = rx.recv().await.unwrap().unwrap();
    assert_eq!(created.events[0].kv.key, key);
    let deleted = rx.recv().await.unwrap().unwrap();
    assert_eq!(
        deleted.events[0].prev_kv.as_ref().map(|kv| kv.value.as_str()),
        Some("a")
    );
}

#[tokio::test]
async fn test_nodes_share_membership_through_etcd() {
    let Some(store) = connect().await else {
        return;
    };
    let config = isolated_config();

    // Separate clients, as separate processes would have
    let other = connect().await.unwrap();
    let a = Node::new("a", Arc::new(store), config.clone()).await.unwrap();
    let b = Node::new("b", Arc::new(other), config).await.unwrap();

    eventually(10, || a.nodes().len() == 2).await;
    assert_eq!(a.nodes(), vec!["a", "b"]);
    assert_eq!(b.nodes(), vec!["a", "b"]);

    let owner = a.node_for("job-1").unwrap();
    assert_eq!(b.node_for("job-1").unwrap(), owner);

    b.shutdown().await;
    eventually(10, || a.nodes() == vec!["a"]).await;
    a.shutdown().await;
}
