//! In-process transport over real LRU stores, for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Semaphore;

use shardcache_core::types::{KeyValue, Mappings, NodeId};
use shardcache_core::Error;
use shardcache_storage::LruStore;

use crate::error::{ClusterError, ClusterResult};
use crate::transport::CacheTransport;

#[derive(Default)]
pub struct MemoryTransport {
    nodes: RwLock<HashMap<NodeId, Arc<LruStore>>>,
    down: RwLock<HashSet<NodeId>>,
    puts: AtomicUsize,
    fetches: AtomicUsize,
    /// When set, each `put` waits for a permit
    put_gate: RwLock<Option<Arc<Semaphore>>>,
    /// When set, each `fetch_mappings` waits for a permit
    fetch_gate: RwLock<Option<Arc<Semaphore>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: &str, capacity: usize) -> Arc<LruStore> {
        let store = Arc::new(LruStore::new(capacity));
        self.nodes
            .write()
            .insert(node.to_string(), Arc::clone(&store));
        store
    }

    pub fn store(&self, node: &str) -> Arc<LruStore> {
        self.nodes
            .read()
            .get(node)
            .cloned()
            .unwrap_or_else(|| panic!("unknown test node {}", node))
    }

    pub fn set_down(&self, node: &str, down: bool) {
        if down {
            self.down.write().insert(node.to_string());
        } else {
            self.down.write().remove(node);
        }
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Park every later `put` until the returned semaphore hands out a
    /// permit
    pub fn hold_puts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.put_gate.write() = Some(Arc::clone(&gate));
        gate
    }

    /// Park every later `fetch_mappings` until the returned semaphore
    /// hands out a permit
    pub fn hold_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.fetch_gate.write() = Some(Arc::clone(&gate));
        gate
    }

    fn reachable(&self, node: &str) -> ClusterResult<Arc<LruStore>> {
        if self.down.read().contains(node) {
            return Err(ClusterError::NodeUnreachable(node.to_string()));
        }
        self.nodes
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| ClusterError::NodeUnreachable(node.to_string()))
    }
}

#[async_trait]
impl CacheTransport for MemoryTransport {
    async fn put(&self, node: &str, pair: &KeyValue) -> ClusterResult<()> {
        pass(&self.put_gate).await;
        let store = self.reachable(node)?;
        store.put(pair.key.clone(), pair.value.clone());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, node: &str, key: &str) -> ClusterResult<Option<String>> {
        match self.reachable(node)?.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(Error::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_mappings(&self, node: &str) -> ClusterResult<Mappings> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        pass(&self.fetch_gate).await;
        Ok(self.reachable(node)?.mappings())
    }

    async fn probe(&self, node: &str) -> ClusterResult<()> {
        self.reachable(node).map(|_| ())
    }
}

async fn pass(gate: &RwLock<Option<Arc<Semaphore>>>) {
    let gate = gate.read().clone();
    if let Some(gate) = gate {
        if let Ok(permit) = gate.acquire().await {
            permit.forget();
        }
    }
}
