//! Shared types for the cache cluster

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for an auxiliary node (its `host:port` address)
pub type NodeId = String;

/// Flat key→value mapping, the unit of snapshots, handoffs and rebalancing
pub type Mappings = HashMap<String, String>;

/// A single cached pair as it travels over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Believed liveness of an auxiliary node, as seen by one master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// No probe has completed yet
    #[default]
    Unknown,
    /// Last probe succeeded
    Alive,
    /// Last probe failed
    Dead,
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

/// Liveness snapshot of a single node, exposed to the routing layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeLiveness {
    pub id: NodeId,
    pub liveness: Liveness,
    /// Whether the node currently owns points on the hash ring
    pub in_ring: bool,
    /// When the coordinator last changed this node's liveness
    pub last_transition: Option<DateTime<Utc>>,
}
