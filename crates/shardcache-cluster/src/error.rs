//! Cluster error types

use thiserror::Error;

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Cluster-related errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Hash ring has no nodes")]
    EmptyRing,

    #[error("Node not found for the key: {0}")]
    NodeNotFound(String),

    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Coordination node already exists: {0}")]
    CoordinationNodeExists(String),

    #[error("Coordination node does not exist: {0}")]
    CoordinationNoNode(String),

    #[error("Lock wait abandoned: {0}")]
    LockAbandoned(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] shardcache_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Status the routing layer answers with when this error reaches it
    pub fn http_status(&self) -> u16 {
        match self {
            ClusterError::Storage(e) => e.http_status(),
            ClusterError::NodeUnreachable(_) | ClusterError::Transport(_) => 502,
            ClusterError::CoordinationUnavailable(_) => 503,
            _ => 500,
        }
    }
}
