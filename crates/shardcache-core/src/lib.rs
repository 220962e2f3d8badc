//! Shardcache Core Library
//!
//! Configuration, error types and shared data types for the sharded
//! LRU cache cluster.

pub mod config;
pub mod error;
pub mod types;

pub use config::ShardCacheConfig;
pub use error::{Error, Result};

/// Shardcache version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of virtual replicas per node on the hash ring
pub const DEFAULT_REPLICAS: usize = 3;

/// Upper bound on rebalance workers per batch
pub const MAX_REBALANCE_WORKERS: usize = 16;

/// Default LRU capacity (entries) of an auxiliary node
pub const DEFAULT_CAPACITY: usize = 1024;
