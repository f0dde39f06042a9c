//! Property tests for consistent-hash ownership

use std::collections::BTreeSet;

use fleetdist::distribution::{Assigner, HashRing};
use proptest::prelude::*;

fn node_sets() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("[a-z][a-z0-9-]{0,11}", 1..8)
}

fn keys() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[ -~]{0,24}", 1..64)
}

fn assigners(nodes: &BTreeSet<String>) -> Vec<Assigner> {
    nodes
        .iter()
        .map(|id| Assigner::with_nodes(id.clone(), nodes.iter()))
        .collect()
}

proptest! {
    #[test]
    fn every_key_has_exactly_one_owner(nodes in node_sets(), keys in keys()) {
        let fleet = assigners(&nodes);
        for key in &keys {
            let owners = fleet.iter().filter(|a| a.must_check_is_owner(key)).count();
            prop_assert_eq!(owners, 1);
        }
    }

    #[test]
    fn owner_does_not_depend_on_insertion_order(nodes in node_sets(), keys in keys()) {
        let forward = Assigner::with_nodes("observer", nodes.iter());
        let backward = Assigner::with_nodes("observer", nodes.iter().rev());
        for key in &keys {
            prop_assert_eq!(forward.node_for(key).unwrap(), backward.node_for(key).unwrap());
            prop_assert!(nodes.contains(forward.must_get_node_for(key)));
        }
    }

    #[test]
    fn joining_node_only_takes_keys(nodes in node_sets(), keys in keys(), joiner in "[A-Z]{1,8}") {
        let before = Assigner::with_nodes("observer", nodes.iter());
        let mut after = before.clone();
        prop_assert!(after.add_node(&joiner));

        for key in &keys {
            let old = before.must_get_node_for(key);
            let new = after.must_get_node_for(key);
            prop_assert!(new == old || new == joiner, "key {} moved from {} to {}", key, old, new);
        }
    }

    #[test]
    fn leaving_node_only_gives_keys(nodes in node_sets(), keys in keys(), pick in any::<prop::sample::Index>()) {
        prop_assume!(nodes.len() > 1);
        let members: Vec<&String> = nodes.iter().collect();
        let leaver = members[pick.index(members.len())];

        let before = Assigner::with_nodes("observer", nodes.iter());
        let mut after = before.clone();
        prop_assert!(after.remove_node(leaver));

        for key in &keys {
            let old = before.must_get_node_for(key);
            if old != leaver.as_str() {
                prop_assert_eq!(after.must_get_node_for(key), old);
            }
        }
    }

    #[test]
    fn removal_matches_fresh_ring(nodes in node_sets(), keys in keys()) {
        let mut ring = HashRing::new();
        for node in &nodes {
            ring.add(node);
        }
        let first = nodes.iter().next().cloned().unwrap_or_default();
        ring.remove(&first);

        let mut fresh = HashRing::new();
        for node in nodes.iter().filter(|n| **n != first) {
            fresh.add(node);
        }

        for key in &keys {
            prop_assert_eq!(ring.get(key), fresh.get(key));
        }
    }
}

#[test]
fn empty_assigner_has_no_owner() {
    let assigner = Assigner::new("a");
    assert!(assigner.node_for("key").is_err());
    assert!(assigner.is_owner("key").is_err());
}

#[test]
fn keys_spread_over_nodes() {
    let nodes = ["a", "b", "c", "d"];
    let assigner = Assigner::with_nodes("a", nodes);
    for node in nodes {
        let owned = (0..4000)
            .filter(|i| assigner.must_get_node_for(&format!("job-{i}")) == node)
            .count();
        assert!(owned > 200, "node {node} owns only {owned} of 4000 keys");
    }
}
