//! Shardcache Cluster - routing, membership and rebalancing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Shardcache Master                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐   │
//! │  │  Membership   │  │  Coordinator  │  │  Rebalancer   │   │
//! │  │   Tracker     │─▶│               │─▶│               │   │
//! │  │ - Probe loops │  │ - Ring edits  │  │ - Worker pool │   │
//! │  │ - Alive/Dead  │  │ - Handoff     │  │ - Best effort │   │
//! │  └───────┬───────┘  └───────┬───────┘  └───────┬───────┘   │
//! │          │                  │                  │           │
//! │          │          ┌───────┴───────┐          │           │
//! │          │          │   HashRing    │◀─────────┤           │
//! │          │          └───────────────┘          │           │
//! │          │          ┌───────────────┐          │           │
//! │          │          │  Lock + Reg.  │          │           │
//! │          │          │ (coordination)│          │           │
//! │          │          └───────────────┘          │           │
//! │          └──────────────────┬──────────────────┘           │
//! │                    ┌────────┴────────┐                      │
//! │                    │    Transport    │                      │
//! │                    │     (HTTP)      │                      │
//! │                    └─────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Consistent Hashing**: CRC32 ring with virtual replicas
//! - **Failure Detection**: Independent probe loop per auxiliary
//! - **Graceful Leave**: Handed-off data is redistributed and backed up
//! - **Targeted Reshard**: A rejoining node only pulls from affected owners
//! - **Multi-Master**: Topology changes serialized by a FIFO lock

mod coordination;
mod coordinator;
mod error;
mod lock;
mod membership;
mod memory;
mod rebalancer;
mod registry;
mod ring;
mod transport;

#[cfg(test)]
mod testing;

pub use coordination::{
    child_path, ensure_path, watch_children_stream, CoordinationService, CreateMode, Watch,
    WatchEvent,
};
pub use coordinator::{ClusterCoordinator, ClusterCoordinatorBuilder};
pub use error::{ClusterError, ClusterResult};
pub use lock::DistributedLock;
pub use membership::{MembershipEvent, MembershipTracker};
pub use memory::{MemoryCoordinator, MemorySession};
pub use rebalancer::{RebalanceConfig, RebalanceEngine, RebalanceHandle, RebalanceStats};
pub use registry::ClusterRegistry;
pub use ring::{ring_hash, HashRing};
pub use transport::{
    validate_node_id, CacheTransport, ClusterTransport, TransportConfig, AUX_SERVER_HEADER,
};

// Re-export types from core
pub use shardcache_core::types::{KeyValue, Liveness, Mappings, NodeId, NodeLiveness};
