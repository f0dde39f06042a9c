//! Ownership assignment
//!
//! The [`Assigner`] answers "which node owns this key" from a consistent-hash
//! ring of the known nodes. The live instance is owned by the
//! [`Node`](super::Node) and mutated only by its watch loop; a clone is an
//! independent snapshot that never changes, which is what long-running work
//! receives so that its ownership decisions stay consistent.

use super::error::{DistributionError, DistributionResult};
use super::ring::HashRing;

#[derive(Debug, Clone)]
pub struct Assigner {
    node_id: String,
    ring: HashRing,
}

impl Assigner {
    /// Create an assigner for `node_id` with an empty ring
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ring: HashRing::new(),
        }
    }

    /// Create an assigner with a known set of nodes
    pub fn with_nodes<I, S>(node_id: impl Into<String>, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut assigner = Self::new(node_id);
        for node in nodes {
            assigner.add_node(node.as_ref());
        }
        assigner
    }

    /// ID of the node this assigner belongs to
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Known nodes, sorted
    pub fn nodes(&self) -> Vec<String> {
        self.ring.members().map(str::to_string).collect()
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.ring.contains(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.ring.len()
    }

    /// Node owning the key
    pub fn node_for(&self, key: &str) -> DistributionResult<&str> {
        self.ring.get(key).ok_or(DistributionError::NoNodes)
    }

    /// Node owning the key.
    ///
    /// # Panics
    ///
    /// Panics if no node is known.
    pub fn must_get_node_for(&self, key: &str) -> &str {
        match self.node_for(key) {
            Ok(node) => node,
            Err(err) => panic!("cannot get node for key \"{key}\": {err}"),
        }
    }

    /// Check if this node owns the key
    pub fn is_owner(&self, key: &str) -> DistributionResult<bool> {
        Ok(self.node_for(key)? == self.node_id)
    }

    /// Check if this node owns the key.
    ///
    /// # Panics
    ///
    /// Panics if no node is known.
    pub fn must_check_is_owner(&self, key: &str) -> bool {
        self.must_get_node_for(key) == self.node_id
    }

    /// Add a node, returns false if it was already known
    pub fn add_node(&mut self, node_id: &str) -> bool {
        self.ring.add(node_id)
    }

    /// Remove a node, returns false if it was not known
    pub fn remove_node(&mut self, node_id: &str) -> bool {
        self.ring.remove(node_id)
    }

    /// Forget all nodes
    pub fn reset_nodes(&mut self) {
        self.ring.clear();
    }
}
