//! Consistent-hash ring
//!
//! Every member is placed on a 64-bit ring at several virtual points. A key
//! belongs to the member owning the first point at or after the key's
//! position, wrapping around at the end of the ring. Adding or removing a
//! member only moves the keys between its points and their predecessors.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Virtual points per member
pub const DEFAULT_REPLICAS: usize = 20;

/// Position of a value on the ring
pub fn hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    points: BTreeMap<u64, String>,
    members: BTreeSet<String>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

impl HashRing {
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_REPLICAS)
    }

    pub fn with_replicas(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            points: BTreeMap::new(),
            members: BTreeSet::new(),
        }
    }

    /// Add a member, returns false if it was already present
    pub fn add(&mut self, member: &str) -> bool {
        if !self.members.insert(member.to_string()) {
            return false;
        }
        self.place(member);
        true
    }

    /// Remove a member, returns false if it was not present
    pub fn remove(&mut self, member: &str) -> bool {
        if !self.members.remove(member) {
            return false;
        }
        // Points lost in a collision belong to another member, rebuild all.
        self.points.clear();
        let members: Vec<String> = self.members.iter().cloned().collect();
        for member in &members {
            self.place(member);
        }
        true
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.members.clear();
    }

    /// Member owning the key, `None` for an empty ring
    pub fn get(&self, key: &str) -> Option<&str> {
        let position = hash(key);
        self.points
            .range(position..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, member)| member.as_str())
    }

    /// Members in sorted order
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn place(&mut self, member: &str) {
        for i in 0..self.replicas {
            let position = hash(&format!("{member}#{i}"));
            match self.points.get(&position) {
                Some(existing) if existing.as_str() <= member => {}
                _ => {
                    self.points.insert(position, member.to_string());
                }
            }
        }
    }
}
