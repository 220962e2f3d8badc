//! Consistent hashing with virtual replicas.
//!
//! Each physical node occupies `replicas` points on a 32-bit ring, placed at
//! `crc32("<node>:<i>")`. A key is owned by the first point at or after its
//! own hash, wrapping to the lowest point past the top of the ring.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::debug;

use shardcache_core::types::NodeId;

use crate::error::{ClusterError, ClusterResult};

/// Hash a key (or a replica label) onto the ring
pub fn ring_hash(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Label hashed to place replica `index` of `node`
fn replica_label(node: &str, index: usize) -> String {
    format!("{}:{}", node, index)
}

#[derive(Debug, Default)]
struct RingState {
    /// Distinct point hashes, ascending
    sorted: Vec<u32>,
    /// Point hash → owning node
    owners: HashMap<u32, NodeId>,
}

impl RingState {
    fn owner_of(&self, hash: u32) -> ClusterResult<NodeId> {
        if self.sorted.is_empty() {
            return Err(ClusterError::EmptyRing);
        }

        let mut index = self.sorted.partition_point(|point| *point < hash);
        if index == self.sorted.len() {
            index = 0;
        }

        let point = self.sorted[index];
        self.owners
            .get(&point)
            .cloned()
            .ok_or_else(|| ClusterError::NodeNotFound(format!("ring point {}", point)))
    }
}

/// A consistent hash ring shared between request handlers and the
/// coordinator. All operations take the same mutex, so a lookup never sees
/// a half-applied membership change.
#[derive(Debug)]
pub struct HashRing {
    replicas: usize,
    state: Mutex<RingState>,
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            state: Mutex::new(RingState::default()),
        }
    }

    /// Build a ring already holding `nodes`
    pub fn with_nodes<I, S>(replicas: usize, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let ring = Self::new(replicas);
        for node in nodes {
            ring.add_node(node);
        }
        ring
    }

    /// Virtual points created per node
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Place `node`'s replica points. Re-adding a node overwrites the same
    /// points; on a hash collision the last writer owns the point.
    pub fn add_node(&self, node: impl Into<NodeId>) {
        let node = node.into();
        let mut state = self.state.lock();

        for i in 0..self.replicas {
            let hash = ring_hash(&replica_label(&node, i));
            if state.owners.insert(hash, node.clone()).is_none() {
                state.sorted.push(hash);
            }
        }
        state.sorted.sort_unstable();

        debug!("Added {} to ring ({} points)", node, state.sorted.len());
    }

    /// Drop every point owned by `node`. No-op for unknown nodes.
    pub fn remove_node(&self, node: &str) {
        let mut state = self.state.lock();
        let before = state.sorted.len();

        state.owners.retain(|_, owner| owner != node);
        let RingState { sorted, owners } = &mut *state;
        sorted.retain(|hash| owners.contains_key(hash));

        if state.sorted.len() != before {
            debug!("Removed {} from ring ({} points)", node, state.sorted.len());
        }
    }

    /// Owner of `key`
    pub fn get_node(&self, key: &str) -> ClusterResult<NodeId> {
        let hash = ring_hash(key);
        self.state.lock().owner_of(hash)
    }

    /// Distinct current owners of the positions `node` would occupy if it
    /// were added now. These are the only nodes whose keys can move to
    /// `node` on insertion. Empty when the ring is empty.
    pub fn owners_of_positions(&self, node: &str) -> Vec<NodeId> {
        let state = self.state.lock();
        let owners: BTreeSet<NodeId> = (0..self.replicas)
            .filter_map(|i| state.owner_of(ring_hash(&replica_label(node, i))).ok())
            .filter(|owner| owner != node)
            .collect();
        owners.into_iter().collect()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.state.lock().owners.values().any(|owner| owner == node)
    }

    /// Distinct member nodes, sorted
    pub fn nodes(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        let nodes: BTreeSet<NodeId> = state.owners.values().cloned().collect();
        nodes.into_iter().collect()
    }

    /// Number of points on the ring
    pub fn point_count(&self) -> usize {
        self.state.lock().sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().sorted.is_empty()
    }
}
