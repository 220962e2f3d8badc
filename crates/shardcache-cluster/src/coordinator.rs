//! Cluster coordinator - reacts to membership changes on the master
//!
//! Responsibilities:
//! - Keep the ring in step with node liveness
//! - Migrate handed-off data from leaving nodes
//! - Reshard the affected partitions when a node rejoins
//! - Seed the cluster from the disaster-recovery backup at startup
//! - Serialize topology changes across masters when a lock is configured

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use shardcache_core::types::{Liveness, Mappings, NodeId, NodeLiveness};
use shardcache_core::Error;
use shardcache_storage::SnapshotCodec;

use crate::error::{ClusterError, ClusterResult};
use crate::lock::DistributedLock;
use crate::membership::MembershipEvent;
use crate::rebalancer::{RebalanceConfig, RebalanceEngine, RebalanceHandle};
use crate::registry::ClusterRegistry;
use crate::ring::HashRing;
use crate::transport::CacheTransport;

#[derive(Debug, Clone, Copy, Default)]
struct NodeState {
    liveness: Liveness,
    last_transition: Option<DateTime<Utc>>,
}

/// Master-side cluster state and the transitions applied to it
pub struct ClusterCoordinator {
    ring: Arc<HashRing>,
    liveness: RwLock<HashMap<NodeId, NodeState>>,
    rebalancer: RebalanceEngine,
    transport: Arc<dyn CacheTransport>,
    /// Serializes topology changes within this master
    topology: Mutex<()>,
    /// Serializes topology changes across masters
    lock: Option<Arc<DistributedLock>>,
    /// Peer masters to notify after a handoff
    registry: Option<Arc<ClusterRegistry>>,
    backup_path: Option<PathBuf>,
    /// Serializes read-merge-write cycles on the backup file
    backup_guard: Arc<Mutex<()>>,
    /// Nodes whose first probe gates startup recovery
    static_nodes: Vec<NodeId>,
    recovery_pending: AtomicBool,
}

impl ClusterCoordinator {
    pub fn builder() -> ClusterCoordinatorBuilder {
        ClusterCoordinatorBuilder::new()
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    pub fn transport(&self) -> &Arc<dyn CacheTransport> {
        &self.transport
    }

    pub fn rebalancer(&self) -> &RebalanceEngine {
        &self.rebalancer
    }

    /// Owner of `key` on the current ring
    pub fn route(&self, key: &str) -> ClusterResult<NodeId> {
        self.ring.get_node(key)
    }

    /// Believed liveness of `node`
    pub fn liveness(&self, node: &str) -> Liveness {
        self.liveness
            .read()
            .get(node)
            .map(|s| s.liveness)
            .unwrap_or_default()
    }

    /// Every node known from probing or the ring, sorted by id
    pub fn nodes(&self) -> Vec<NodeLiveness> {
        let states = self.liveness.read();
        let mut ids: Vec<NodeId> = states.keys().cloned().collect();
        for node in self.ring.nodes() {
            if !states.contains_key(&node) {
                ids.push(node);
            }
        }
        for node in &self.static_nodes {
            if !ids.contains(node) {
                ids.push(node.clone());
            }
        }
        ids.sort();

        ids.into_iter()
            .map(|id| {
                let state = states.get(&id).copied().unwrap_or_default();
                NodeLiveness {
                    in_ring: self.ring.contains(&id),
                    liveness: state.liveness,
                    last_transition: state.last_transition,
                    id,
                }
            })
            .collect()
    }

    /// Apply one membership event. Repeated states are no-ops.
    pub async fn handle_event(&self, event: MembershipEvent) -> ClusterResult<()> {
        let changed = match &event {
            MembershipEvent::Alive(node) => self.handle_alive(node).await?,
            MembershipEvent::Dead(node) => self.handle_dead(node).await?,
        };

        if changed {
            self.maybe_recover().await;
        }
        Ok(())
    }

    /// Drop `node` from the ring and mark it dead. Its data is not
    /// migrated. Returns whether this was a transition.
    pub async fn handle_dead(&self, node: &str) -> ClusterResult<bool> {
        if self.liveness(node) == Liveness::Dead {
            return Ok(false);
        }

        self.guarded(|| async move {
            if self.liveness(node) == Liveness::Dead {
                return false;
            }
            self.ring.remove_node(node);
            self.set_liveness(node, Liveness::Dead);
            true
        })
        .await
        .map(|changed| {
            if changed {
                warn!("Auxiliary {} is dead, removed from ring", node);
            }
            changed
        })
    }

    /// Re-admit `node`: fetch the mappings of the owners it will take
    /// points from, add it to the ring, then redistribute what was fetched.
    /// Returns whether this was a transition.
    pub async fn handle_alive(&self, node: &str) -> ClusterResult<bool> {
        if self.liveness(node) == Liveness::Alive {
            return Ok(false);
        }

        let handle = self
            .guarded(|| async move {
                if self.liveness(node) == Liveness::Alive {
                    return None;
                }

                let affected = self.ring.owners_of_positions(node);
                let merged = self.fetch_all(&affected).await;

                self.set_liveness(node, Liveness::Alive);
                self.ring.add_node(node);
                info!(
                    "Auxiliary {} is alive, resharding {} keys from {:?}",
                    node,
                    merged.len(),
                    affected
                );

                Some(self.rebalancer.rebalance(merged).await)
            })
            .await?;

        Ok(match handle {
            Some(handle) => {
                handle.detach();
                true
            }
            None => false,
        })
    }

    /// Absorb the data of a node that is leaving gracefully. The node is
    /// removed first so that no pair is routed back to it.
    pub async fn handle_handoff(
        &self,
        node: &str,
        mappings: Mappings,
    ) -> ClusterResult<RebalanceHandle> {
        let count = mappings.len();
        let backup = mappings.clone();

        let handle = self
            .guarded(|| async move {
                self.ring.remove_node(node);
                self.set_liveness(node, Liveness::Dead);
                self.rebalancer.rebalance(mappings).await
            })
            .await?;

        info!("Auxiliary {} handed off {} keys", node, count);
        self.persist_backup(backup);
        self.notify_peers(node).await;

        Ok(handle)
    }

    /// Remove a node another master has already absorbed
    pub async fn handle_peer_removal(&self, node: &str) -> ClusterResult<bool> {
        info!("Peer master reported removal of {}", node);
        self.handle_dead(node).await
    }

    /// Rebalance the contents of the backup file over the current ring.
    /// A missing or unreadable backup is not an error.
    pub async fn recover_from_backup(&self) -> ClusterResult<Option<RebalanceHandle>> {
        let Some(path) = self.backup_path.as_ref() else {
            return Ok(None);
        };

        let mappings = match SnapshotCodec::load(path).await {
            Ok(mappings) => mappings,
            Err(Error::SnapshotNotFound(_)) => {
                info!("No backup at {:?}, nothing to recover", path);
                return Ok(None);
            }
            Err(e) if e.is_missing_or_corrupt_snapshot() => {
                warn!("Ignoring unreadable backup {:?}: {}", path, e);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        info!("Recovering {} keys from backup {:?}", mappings.len(), path);
        let handle = self
            .guarded(|| async move { self.rebalancer.rebalance(mappings).await })
            .await?;
        Ok(Some(handle))
    }

    /// Consume membership events until `cancel` fires or the stream ends
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<MembershipEvent>,
        cancel: CancellationToken,
    ) {
        info!("Cluster coordinator started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            debug!("Membership event: {:?}", event);
            if let Err(e) = self.handle_event(event).await {
                error!("Failed to apply membership event: {}", e);
            }
        }

        info!("Cluster coordinator stopped");
    }

    /// Consume removal notices from peer masters
    pub async fn run_peer_removals(
        self: Arc<Self>,
        mut removals: mpsc::Receiver<NodeId>,
        cancel: CancellationToken,
    ) {
        loop {
            let node = tokio::select! {
                _ = cancel.cancelled() => break,
                node = removals.recv() => match node {
                    Some(node) => node,
                    None => break,
                },
            };

            if let Err(e) = self.handle_peer_removal(&node).await {
                error!("Failed to apply peer removal of {}: {}", node, e);
            }
        }
    }

    async fn guarded<F, Fut, T>(&self, f: F) -> ClusterResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _local = self.topology.lock().await;
        match &self.lock {
            Some(lock) => lock.run_exclusive(f).await,
            None => Ok(f().await),
        }
    }

    fn set_liveness(&self, node: &str, liveness: Liveness) {
        let mut states = self.liveness.write();
        let state = states.entry(node.to_string()).or_default();
        if state.liveness != liveness {
            state.liveness = liveness;
            state.last_transition = Some(Utc::now());

            let to = match liveness {
                Liveness::Alive => "alive",
                Liveness::Dead => "dead",
                Liveness::Unknown => "unknown",
            };
            metrics::counter!("shardcache_membership_transitions_total", "to" => to).increment(1);
        }
        drop(states);

        metrics::gauge!("shardcache_ring_nodes").set(self.ring.nodes().len() as f64);
    }

    async fn fetch_all(&self, owners: &[NodeId]) -> Mappings {
        let fetches = owners.iter().map(|owner| async move {
            (owner, self.transport.fetch_mappings(owner).await)
        });

        let mut merged = Mappings::new();
        for (owner, result) in join_all(fetches).await {
            match result {
                Ok(mappings) => merged.extend(mappings),
                Err(e) => warn!("Failed to fetch mappings from {}: {}", owner, e),
            }
        }
        merged
    }

    /// Merge `mappings` into the backup file in the background
    fn persist_backup(&self, mappings: Mappings) {
        let Some(path) = self.backup_path.clone() else {
            return;
        };
        let guard = Arc::clone(&self.backup_guard);

        tokio::spawn(async move {
            let _held = guard.lock().await;

            let mut merged = match SnapshotCodec::load(&path).await {
                Ok(existing) => existing,
                Err(e) if e.is_missing_or_corrupt_snapshot() => Mappings::new(),
                Err(e) => {
                    error!("Failed to read backup {:?}: {}", path, e);
                    return;
                }
            };
            merged.extend(mappings);

            match SnapshotCodec::save_mappings(&merged, &path).await {
                Ok(()) => debug!("Backup {:?} now holds {} keys", path, merged.len()),
                Err(e) => error!("Failed to write backup {:?}: {}", path, e),
            }
        });
    }

    async fn notify_peers(&self, node: &str) {
        let Some(registry) = &self.registry else {
            return;
        };
        match registry.broadcast_removal(node).await {
            Ok(0) => {}
            Ok(n) => debug!("Notified {} peer masters of {}", n, node),
            Err(e) => warn!("Failed to notify peer masters of {}: {}", node, e),
        }
    }

    /// Run startup recovery once every static node has been probed
    async fn maybe_recover(&self) {
        if !self.recovery_pending.load(Ordering::SeqCst) {
            return;
        }

        let all_probed = {
            let states = self.liveness.read();
            self.static_nodes.iter().all(|node| {
                states
                    .get(node)
                    .is_some_and(|s| s.liveness != Liveness::Unknown)
            })
        };
        if !all_probed || !self.recovery_pending.swap(false, Ordering::SeqCst) {
            return;
        }

        match self.recover_from_backup().await {
            Ok(Some(handle)) => handle.detach(),
            Ok(None) => {}
            Err(e) => error!("Backup recovery failed: {}", e),
        }
    }
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("ring_nodes", &self.ring.nodes())
            .field("static_nodes", &self.static_nodes)
            .field("backup_path", &self.backup_path)
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

/// Builder for ClusterCoordinator
pub struct ClusterCoordinatorBuilder {
    replicas: usize,
    ring: Option<Arc<HashRing>>,
    transport: Option<Arc<dyn CacheTransport>>,
    lock: Option<Arc<DistributedLock>>,
    registry: Option<Arc<ClusterRegistry>>,
    backup_path: Option<PathBuf>,
    static_nodes: Vec<NodeId>,
    recover_on_startup: bool,
    rebalance: RebalanceConfig,
}

impl ClusterCoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            replicas: shardcache_core::DEFAULT_REPLICAS,
            ring: None,
            transport: None,
            lock: None,
            registry: None,
            backup_path: None,
            static_nodes: Vec::new(),
            recover_on_startup: true,
            rebalance: RebalanceConfig::default(),
        }
    }

    /// Virtual points per node, when the builder creates the ring
    pub fn replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Share an existing ring instead of creating an empty one
    pub fn ring(mut self, ring: Arc<HashRing>) -> Self {
        self.ring = Some(ring);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn CacheTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn lock(mut self, lock: Arc<DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn registry(mut self, registry: Arc<ClusterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }

    /// Statically configured auxiliaries
    pub fn static_nodes(mut self, nodes: Vec<NodeId>) -> Self {
        self.static_nodes = nodes;
        self
    }

    /// Whether to restore the backup once the static nodes are probed
    pub fn recover_on_startup(mut self, enabled: bool) -> Self {
        self.recover_on_startup = enabled;
        self
    }

    pub fn max_rebalance_workers(mut self, workers: usize) -> Self {
        self.rebalance.max_workers = workers;
        self
    }

    pub fn build(self) -> ClusterResult<ClusterCoordinator> {
        let transport = self.transport.ok_or_else(|| {
            ClusterError::InvalidConfig("coordinator requires a transport".to_string())
        })?;
        if self.rebalance.max_workers == 0 {
            return Err(ClusterError::InvalidConfig(
                "rebalance workers must be at least 1".to_string(),
            ));
        }

        let ring = self
            .ring
            .unwrap_or_else(|| Arc::new(HashRing::new(self.replicas)));
        let rebalancer =
            RebalanceEngine::new(Arc::clone(&ring), Arc::clone(&transport), self.rebalance);
        let recovery_pending = self.recover_on_startup && self.backup_path.is_some();

        Ok(ClusterCoordinator {
            ring,
            liveness: RwLock::new(HashMap::new()),
            rebalancer,
            transport,
            topology: Mutex::new(()),
            lock: self.lock,
            registry: self.registry,
            backup_path: self.backup_path,
            backup_guard: Arc::new(Mutex::new(())),
            static_nodes: self.static_nodes,
            recovery_pending: AtomicBool::new(recovery_pending),
        })
    }
}

impl Default for ClusterCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinator;
    use crate::testing::MemoryTransport;
    use shardcache_core::config::CoordinationConfig;
    use shardcache_core::types::KeyValue;
    use std::time::Duration;
    use tempfile::tempdir;

    const NODES: [&str; 3] = ["aux1", "aux2", "aux3"];

    fn transport_with(nodes: &[&str]) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport::new());
        for node in nodes {
            transport.add_node(node, 10_000);
        }
        transport
    }

    async fn coordinator_with_alive(
        transport: &Arc<MemoryTransport>,
        nodes: &[&str],
    ) -> ClusterCoordinator {
        let coordinator = ClusterCoordinator::builder()
            .replicas(3)
            .transport(transport.clone())
            .build()
            .unwrap();
        for node in nodes {
            assert!(coordinator.handle_alive(node).await.unwrap());
        }
        coordinator
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_builder_requires_transport() {
        assert!(ClusterCoordinator::builder().build().is_err());
    }

    #[tokio::test]
    async fn test_dead_owner_reroutes_key() {
        let transport = transport_with(&NODES);
        let coordinator = coordinator_with_alive(&transport, &NODES).await;

        let first = coordinator.route("foo").unwrap();
        transport
            .put(&first, &KeyValue::new("foo", "bar"))
            .await
            .unwrap();

        coordinator
            .handle_event(MembershipEvent::Dead(first.clone()))
            .await
            .unwrap();

        let second = coordinator.route("foo").unwrap();
        assert_ne!(second, first);
        assert_eq!(coordinator.liveness(&second), Liveness::Alive);
        assert_eq!(coordinator.liveness(&first), Liveness::Dead);
        assert!(!coordinator.ring().contains(&first));
    }

    #[tokio::test]
    async fn test_repeated_events_are_noops() {
        let transport = transport_with(&NODES);
        let coordinator = coordinator_with_alive(&transport, &NODES).await;

        assert!(!coordinator.handle_alive("aux1").await.unwrap());
        assert!(coordinator.handle_dead("aux1").await.unwrap());
        assert!(!coordinator.handle_dead("aux1").await.unwrap());

        let nodes = coordinator.nodes();
        let aux1 = nodes.iter().find(|n| n.id == "aux1").unwrap();
        assert_eq!(aux1.liveness, Liveness::Dead);
        assert!(!aux1.in_ring);
        assert!(aux1.last_transition.is_some());
    }

    #[tokio::test]
    async fn test_unknown_to_dead_never_joins_ring() {
        let transport = transport_with(&NODES);
        let coordinator = coordinator_with_alive(&transport, &["aux1"]).await;

        assert!(coordinator.handle_dead("aux2").await.unwrap());
        assert_eq!(coordinator.ring().nodes(), vec!["aux1"]);
        for node in coordinator.nodes() {
            if node.in_ring {
                assert_eq!(node.liveness, Liveness::Alive);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_topology_changes_serialize_without_lock() {
        let transport = transport_with(&["aux1", "aux2"]);
        let coordinator = Arc::new(coordinator_with_alive(&transport, &["aux1"]).await);
        assert!(coordinator.handle_dead("aux2").await.unwrap());

        // Park the rejoin of aux2 while it fetches from aux1
        let gate = transport.hold_fetches();
        let fetches = transport.fetch_count();
        let rejoin = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.handle_alive("aux2").await }
        });
        eventually(|| transport.fetch_count() > fetches).await;

        let mut handoff_mapping = Mappings::new();
        handoff_mapping.insert("k".to_string(), "v".to_string());
        let handoff = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.handle_handoff("aux2", handoff_mapping).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handoff.is_finished());

        gate.add_permits(1);
        assert!(rejoin.await.unwrap().unwrap());
        let stats = handoff.await.unwrap().unwrap().join().await;
        assert_eq!(stats.delivered, 1);

        assert_eq!(coordinator.liveness("aux2"), Liveness::Dead);
        assert!(!coordinator.ring().contains("aux2"));
        assert_eq!(transport.store("aux1").get("k").unwrap(), "v");
    }

    #[tokio::test]
    async fn test_handoff_keys_reachable_at_new_owner() {
        let transport = transport_with(&NODES);
        let coordinator = coordinator_with_alive(&transport, &NODES).await;

        let leaving = coordinator.route("foo").unwrap();
        let handed: Mappings = (0..100)
            .map(|i| (format!("k{}", i), format!("v{}", i)))
            .collect();

        let stats = coordinator
            .handle_handoff(&leaving, handed.clone())
            .await
            .unwrap()
            .join()
            .await;
        assert_eq!(stats.delivered, 100);
        assert!(!coordinator.ring().contains(&leaving));

        for (key, value) in &handed {
            let owner = coordinator.route(key).unwrap();
            assert_ne!(owner, leaving);
            let found = transport.get(&owner, key).await.unwrap();
            assert_eq!(found.as_deref(), Some(value.as_str()));
        }
    }

    #[tokio::test]
    async fn test_rejoin_reshards_affected_keys() {
        let transport = transport_with(&NODES);
        let coordinator = coordinator_with_alive(&transport, &["aux1", "aux2"]).await;

        for i in 0..300 {
            let key = format!("key-{}", i);
            let owner = coordinator.route(&key).unwrap();
            transport
                .put(&owner, &KeyValue::new(key.clone(), format!("v{}", i)))
                .await
                .unwrap();
        }

        coordinator
            .handle_event(MembershipEvent::Alive("aux3".to_string()))
            .await
            .unwrap();

        let moved: Vec<String> = (0..300)
            .map(|i| format!("key-{}", i))
            .filter(|k| coordinator.route(k).unwrap() == "aux3")
            .collect();
        assert!(!moved.is_empty());

        let store = transport.store("aux3");
        eventually(|| moved.iter().all(|k| store.get(k).is_ok())).await;
    }

    #[tokio::test]
    async fn test_first_node_joins_empty_ring() {
        let transport = transport_with(&NODES);
        let coordinator = coordinator_with_alive(&transport, &[]).await;
        assert!(coordinator.route("foo").is_err());

        coordinator.handle_alive("aux2").await.unwrap();
        assert_eq!(coordinator.route("foo").unwrap(), "aux2");
        assert_eq!(transport.put_count(), 0);
    }

    #[tokio::test]
    async fn test_handoff_merges_into_backup() {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("backupCache.dat");

        let mut existing = Mappings::new();
        existing.insert("old".into(), "1".into());
        SnapshotCodec::save_mappings(&existing, &backup).await.unwrap();

        let transport = transport_with(&NODES);
        let coordinator = ClusterCoordinator::builder()
            .transport(transport.clone())
            .backup_path(&backup)
            .recover_on_startup(false)
            .build()
            .unwrap();
        coordinator.handle_alive("aux1").await.unwrap();
        coordinator.handle_alive("aux2").await.unwrap();

        let mut handed = Mappings::new();
        handed.insert("new".into(), "2".into());
        coordinator
            .handle_handoff("aux2", handed)
            .await
            .unwrap()
            .join()
            .await;

        for _ in 0..200 {
            if let Ok(saved) = SnapshotCodec::load(&backup).await {
                if saved.len() == 2 {
                    assert_eq!(saved.get("old").map(String::as_str), Some("1"));
                    assert_eq!(saved.get("new").map(String::as_str), Some("2"));
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("backup never merged");
    }

    #[tokio::test]
    async fn test_recovery_waits_for_static_nodes() {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("backupCache.dat");
        let saved: Mappings = (0..20)
            .map(|i| (format!("r{}", i), format!("v{}", i)))
            .collect();
        SnapshotCodec::save_mappings(&saved, &backup).await.unwrap();

        let transport = transport_with(&NODES);
        let coordinator = ClusterCoordinator::builder()
            .transport(transport.clone())
            .backup_path(&backup)
            .static_nodes(vec!["aux1".into(), "aux2".into()])
            .build()
            .unwrap();

        coordinator
            .handle_event(MembershipEvent::Alive("aux1".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.put_count(), 0);

        coordinator
            .handle_event(MembershipEvent::Dead("aux2".into()))
            .await
            .unwrap();

        let store = transport.store("aux1");
        eventually(|| store.len() == 20).await;
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_backup_is_noop() {
        let dir = tempdir().unwrap();
        let transport = transport_with(&NODES);

        let missing = ClusterCoordinator::builder()
            .transport(transport.clone())
            .backup_path(dir.path().join("absent.dat"))
            .build()
            .unwrap();
        assert!(missing.recover_from_backup().await.unwrap().is_none());

        let corrupt_path = dir.path().join("corrupt.dat");
        std::fs::write(&corrupt_path, b"not json").unwrap();
        let corrupt = ClusterCoordinator::builder()
            .transport(transport)
            .backup_path(&corrupt_path)
            .build()
            .unwrap();
        assert!(corrupt.recover_from_backup().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_locked_coordinators_and_peer_removal() {
        let coord = MemoryCoordinator::new();
        let config = CoordinationConfig::default();
        let transport = transport_with(&NODES);
        let cancel = CancellationToken::new();

        let make = || {
            let session: Arc<dyn crate::coordination::CoordinationService> =
                Arc::new(coord.session());
            let registry = Arc::new(ClusterRegistry::new(Arc::clone(&session), &config));
            let lock = Arc::new(DistributedLock::new(session, config.lock_path.clone()));
            let coordinator = ClusterCoordinator::builder()
                .transport(transport.clone())
                .lock(lock)
                .registry(Arc::clone(&registry))
                .build()
                .unwrap();
            (registry, Arc::new(coordinator))
        };

        let (registry_a, a) = make();
        let (registry_b, b) = make();
        registry_a.register_master("a").await.unwrap();
        registry_b.register_master("b").await.unwrap();

        for node in NODES {
            a.handle_alive(node).await.unwrap();
            b.handle_alive(node).await.unwrap();
        }

        let inbox = registry_b.removal_inbox(cancel.clone()).unwrap();
        tokio::spawn(Arc::clone(&b).run_peer_removals(inbox, cancel.clone()));

        a.handle_handoff("aux3", Mappings::new())
            .await
            .unwrap()
            .join()
            .await;

        eventually(|| !b.ring().contains("aux3")).await;
        assert_eq!(b.liveness("aux3"), Liveness::Dead);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_run_consumes_events_until_cancelled() {
        let transport = transport_with(&NODES);
        let coordinator = Arc::new(
            ClusterCoordinator::builder()
                .transport(transport)
                .build()
                .unwrap(),
        );
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&coordinator).run(rx, cancel.clone()));

        tx.send(MembershipEvent::Alive("aux1".into())).await.unwrap();
        tx.send(MembershipEvent::Alive("aux2".into())).await.unwrap();
        eventually(|| coordinator.ring().nodes().len() == 2).await;

        cancel.cancel();
        task.await.unwrap();
    }
}
