//! Storage for cache nodes: the bounded LRU store and its on-disk snapshot.

mod lru;
mod snapshot;

pub use lru::{LruCore, LruStore};
pub use snapshot::SnapshotCodec;
