//! Common test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleetdist::distribution::{Events, Listener, Node, NodeConfig};
use fleetdist::store::{MemoryClient, MemoryStore};

/// Node configuration with immediate event delivery and a short lease
pub fn test_config() -> NodeConfig {
    NodeConfig::builder()
        .group("test")
        .events_group_interval(Duration::ZERO)
        .session_ttl(Duration::from_secs(2))
        .session_grant_timeout(Duration::from_secs(1))
        .startup_timeout(Duration::from_secs(5))
        .shutdown_timeout(Duration::from_secs(1))
        .self_discovery_timeout(Duration::from_secs(5))
        .build()
        .expect("valid test config")
}

/// Start a node on its own client of `store`
pub async fn start_node(store: &MemoryStore, node_id: &str) -> (Node, MemoryClient) {
    start_node_with(store, node_id, test_config()).await
}

pub async fn start_node_with(
    store: &MemoryStore,
    node_id: &str,
    config: NodeConfig,
) -> (Node, MemoryClient) {
    let client = store.client();
    let node = Node::new(node_id, Arc::new(client.clone()), config)
        .await
        .expect("node should start");
    (node, client)
}

/// Registration key of a node in the test group
pub fn node_key(node_id: &str) -> String {
    format!("{}{node_id}", test_config().nodes_prefix())
}

/// Receive the next batch, failing the test after `secs`
pub async fn next_events(listener: &mut Listener, secs: u64) -> Events {
    tokio::time::timeout(Duration::from_secs(secs), listener.recv())
        .await
        .expect("events should arrive in time")
        .expect("listener should be open")
}

/// Wait until `check` holds, polling every 10ms for at most `secs`
pub async fn eventually<F>(secs: u64, mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(secs), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition should hold in time");
}
