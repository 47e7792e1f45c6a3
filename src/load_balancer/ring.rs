//! Consistent hash ring with weighted virtual nodes.
//!
//! Every node contributes `weight × factor` entries, each positioned by the
//! xxh3 hash of `"{node_id}-{i}"`. A key maps to the first entry clockwise
//! from its own hash. Removing a node only moves the keys that landed on
//! that node's entries.

use super::node::Node;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// Hash a partition key or virtual node label.
#[inline]
#[must_use]
pub fn hash_key(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// A single virtual node position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    /// Position on the ring.
    pub hash: u64,
    /// Owning node.
    pub node_id: Arc<str>,
}

/// Immutable ring, sorted by hash ascending.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    entries: Vec<RingEntry>,
}

impl HashRing {
    /// Build a ring from a node set.
    #[must_use]
    pub fn build(nodes: &[Arc<Node>], factor: u32) -> Self {
        let capacity = nodes
            .iter()
            .map(|n| n.weight() as usize * factor as usize)
            .sum();
        let mut entries = Vec::with_capacity(capacity);

        for node in nodes {
            let node_id: Arc<str> = Arc::from(node.id());
            let count = node.weight() as usize * factor as usize;
            for i in 0..count {
                let label = format!("{}-{}", node.id(), i);
                entries.push(RingEntry {
                    hash: hash_key(label.as_bytes()),
                    node_id: Arc::clone(&node_id),
                });
            }
        }

        entries.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.node_id.cmp(&b.node_id)));
        Self { entries }
    }

    /// Number of virtual entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted entries.
    #[must_use]
    pub fn entries(&self) -> &[RingEntry] {
        &self.entries
    }

    /// Distinct node ids on the ring.
    #[must_use]
    pub fn node_ids(&self) -> HashSet<&str> {
        self.entries.iter().map(|e| &*e.node_id).collect()
    }

    /// Find the owner of `key`, skipping nodes rejected by `accept`.
    ///
    /// Walks clockwise from the first entry whose hash is `>=` the key hash,
    /// wrapping around once.
    pub fn lookup<F>(&self, key: &[u8], accept: F) -> Option<&str>
    where
        F: Fn(&str) -> bool,
    {
        if self.entries.is_empty() {
            return None;
        }

        let target = hash_key(key);
        let start = self.entries.partition_point(|e| e.hash < target);
        let len = self.entries.len();

        (0..len)
            .map(|offset| &self.entries[(start + offset) % len])
            .find(|entry| accept(&entry.node_id))
            .map(|entry| &*entry.node_id)
    }
}

/// Shared handle to the current ring.
///
/// Rebuilds replace the ring wholesale; lookups in flight keep using the
/// ring they loaded.
#[derive(Debug, Default)]
pub struct ConsistentHashRing {
    ring: ArcSwap<HashRing>,
}

impl ConsistentHashRing {
    /// Create an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the given nodes and swap it in.
    pub fn rebuild(&self, nodes: &[Arc<Node>], factor: u32) {
        self.ring.store(Arc::new(HashRing::build(nodes, factor)));
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.ring.store(Arc::new(HashRing::default()));
    }

    /// Current ring.
    #[must_use]
    pub fn load(&self) -> Arc<HashRing> {
        self.ring.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::config::NodeConfig;
    use std::collections::HashMap;

    fn nodes(count: usize) -> Vec<Arc<Node>> {
        (0..count)
            .map(|i| Arc::new(Node::new(&NodeConfig::new(format!("node-{i}"), "10.0.0.1", 8080))))
            .collect()
    }

    #[test]
    fn test_ring_size_follows_weight() {
        let nodes = vec![
            Arc::new(Node::new(&NodeConfig::new("a", "10.0.0.1", 80).with_weight(1))),
            Arc::new(Node::new(&NodeConfig::new("b", "10.0.0.2", 80).with_weight(3))),
        ];
        let ring = HashRing::build(&nodes, 100);

        assert_eq!(ring.len(), 400);
        let b_entries = ring.entries().iter().filter(|e| &*e.node_id == "b").count();
        assert_eq!(b_entries, 300);
        assert!(ring.entries().windows(2).all(|w| w[0].hash <= w[1].hash));
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let ring = HashRing::build(&nodes(5), 100);

        let first = ring.lookup(b"192.168.1.10", |_| true).map(str::to_string);
        let second = ring.lookup(b"192.168.1.10", |_| true).map(str::to_string);
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn test_lookup_skips_rejected_nodes() {
        let ring = HashRing::build(&nodes(3), 50);

        let owner = ring.lookup(b"client-7", |_| true).unwrap().to_string();
        let fallback = ring.lookup(b"client-7", |id| id != owner).unwrap();
        assert_ne!(fallback, owner);

        assert!(ring.lookup(b"client-7", |_| false).is_none());
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::default();
        assert!(ring.is_empty());
        assert!(ring.lookup(b"anything", |_| true).is_none());
    }

    #[test]
    fn test_removal_moves_bounded_fraction() {
        let all = nodes(10);
        let before = HashRing::build(&all, 100);
        let after = HashRing::build(&all[1..], 100);

        let keys: Vec<String> = (0..10_000)
            .map(|i| format!("10.1.{}.{}", i / 256, i % 256))
            .collect();
        let mut moved = 0;
        for key in &keys {
            let old = before.lookup(key.as_bytes(), |_| true).unwrap();
            let new = after.lookup(key.as_bytes(), |_| true).unwrap();
            if old != new {
                // Only keys owned by the removed node may move.
                assert_eq!(old, "node-0");
                moved += 1;
            }
        }

        assert!(moved < 1_500, "moved {moved} of {}", keys.len());
    }

    #[test]
    fn test_distribution_is_roughly_even() {
        let ring = HashRing::build(&nodes(4), 100);
        let mut counts: HashMap<String, usize> = HashMap::new();

        for i in 0..8_000 {
            let key = format!("key-{i}");
            let owner = ring.lookup(key.as_bytes(), |_| true).unwrap();
            *counts.entry(owner.to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            assert!(*count > 1_000 && *count < 3_000, "counts: {counts:?}");
        }
    }

    #[test]
    fn test_shared_ring_swap() {
        let shared = ConsistentHashRing::new();
        assert!(shared.load().is_empty());

        let held = shared.load();
        shared.rebuild(&nodes(2), 10);
        assert!(held.is_empty());
        assert_eq!(shared.load().len(), 20);
        assert_eq!(shared.load().node_ids().len(), 2);

        shared.clear();
        assert!(shared.load().is_empty());
    }
}
