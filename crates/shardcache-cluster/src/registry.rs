//! Registration of auxiliaries and masters in the coordination service
//!
//! Layout:
//! - `<auxiliaries_path>/<host:port>`: one persistent node per auxiliary
//! - `<masters_path>/master-<hostname>`: one ephemeral node per master,
//!   whose data doubles as that master's inbox for peer removal notices

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shardcache_core::config::CoordinationConfig;
use shardcache_core::types::NodeId;

use crate::coordination::{
    child_path, ensure_path, watch_children_stream, CoordinationService, CreateMode, WatchEvent,
};
use crate::error::{ClusterError, ClusterResult};

/// Cluster membership as recorded in the coordination service
pub struct ClusterRegistry {
    coord: Arc<dyn CoordinationService>,
    auxiliaries_path: String,
    masters_path: String,
    /// Path of this master's own registration node, once registered
    own_path: RwLock<Option<String>>,
}

impl ClusterRegistry {
    pub fn new(coord: Arc<dyn CoordinationService>, config: &CoordinationConfig) -> Self {
        Self {
            coord,
            auxiliaries_path: config.auxiliaries_path.clone(),
            masters_path: config.masters_path.clone(),
            own_path: RwLock::new(None),
        }
    }

    pub fn coordinator(&self) -> Arc<dyn CoordinationService> {
        Arc::clone(&self.coord)
    }

    /// Record `node` as a cluster member. Registering twice is a no-op.
    pub async fn register_auxiliary(&self, node: &str) -> ClusterResult<()> {
        ensure_path(self.coord.as_ref(), &self.auxiliaries_path).await?;

        let path = child_path(&self.auxiliaries_path, node);
        match self
            .coord
            .create(&path, Vec::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) => {
                info!("Registered auxiliary {}", node);
                Ok(())
            }
            Err(ClusterError::CoordinationNodeExists(_)) => {
                debug!("Auxiliary {} already registered", node);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Registered auxiliaries, sorted
    pub async fn auxiliaries(&self) -> ClusterResult<Vec<NodeId>> {
        ensure_path(self.coord.as_ref(), &self.auxiliaries_path).await?;
        self.coord.children(&self.auxiliaries_path).await
    }

    /// Stream of the registered auxiliary set, re-sent after each change
    pub async fn watch_auxiliaries(
        &self,
        cancel: CancellationToken,
    ) -> ClusterResult<mpsc::Receiver<Vec<NodeId>>> {
        ensure_path(self.coord.as_ref(), &self.auxiliaries_path).await?;
        Ok(watch_children_stream(
            Arc::clone(&self.coord),
            self.auxiliaries_path.clone(),
            cancel,
        ))
    }

    /// Register this master under `master-<hostname>`
    pub async fn register_master(&self, hostname: &str) -> ClusterResult<String> {
        ensure_path(self.coord.as_ref(), &self.masters_path).await?;

        let path = child_path(&self.masters_path, &format!("master-{}", hostname));
        match self
            .coord
            .create(&path, Vec::new(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => info!("Registered master at {}", path),
            Err(ClusterError::CoordinationNodeExists(_)) => {
                warn!("Master node {} already exists, reusing it", path);
            }
            Err(e) => return Err(e),
        }

        *self.own_path.write() = Some(path.clone());
        Ok(path)
    }

    /// Tell every other registered master that `node` has left. Returns
    /// the number of peers notified.
    pub async fn broadcast_removal(&self, node: &str) -> ClusterResult<usize> {
        let own = self.own_path.read().clone();
        let peers = self.coord.children(&self.masters_path).await?;

        let mut notified = 0;
        for peer in peers {
            let path = child_path(&self.masters_path, &peer);
            if own.as_deref() == Some(path.as_str()) {
                continue;
            }

            match self.coord.set_data(&path, node.as_bytes().to_vec()).await {
                Ok(()) => {
                    debug!("Notified {} of removal of {}", path, node);
                    notified += 1;
                }
                Err(e) => warn!("Failed to notify {} of removal of {}: {}", path, node, e),
            }
        }

        Ok(notified)
    }

    /// Removal notices addressed to this master. Each notice is cleared
    /// from the inbox once delivered. Requires [`register_master`] first.
    ///
    /// [`register_master`]: ClusterRegistry::register_master
    pub fn removal_inbox(&self, cancel: CancellationToken) -> ClusterResult<mpsc::Receiver<NodeId>> {
        let path = self.own_path.read().clone().ok_or_else(|| {
            ClusterError::InvalidConfig("master is not registered".to_string())
        })?;

        let coord = Arc::clone(&self.coord);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let (data, watch) = match coord.watch_data(&path).await {
                    Ok(armed) => armed,
                    Err(e) => {
                        warn!("Failed to watch {}: {}", path, e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        }
                    }
                };

                if let Some(bytes) = data.filter(|b| !b.is_empty()) {
                    let node = String::from_utf8_lossy(&bytes).trim().to_string();
                    if let Err(e) = coord.set_data(&path, Vec::new()).await {
                        warn!("Failed to clear removal notice on {}: {}", path, e);
                    }
                    if !node.is_empty() && tx.send(node).await.is_err() {
                        break;
                    }
                }

                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = watch.wait() => event,
                };
                if event == WatchEvent::SessionClosed {
                    break;
                }
            }

            debug!("Removal inbox on {} stopped", path);
        });

        Ok(rx)
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("auxiliaries_path", &self.auxiliaries_path)
            .field("masters_path", &self.masters_path)
            .field("own_path", &*self.own_path.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinator;

    fn registry(coord: &MemoryCoordinator) -> ClusterRegistry {
        ClusterRegistry::new(Arc::new(coord.session()), &CoordinationConfig::default())
    }

    #[tokio::test]
    async fn test_register_auxiliary_is_idempotent() {
        let coord = MemoryCoordinator::new();
        let reg = registry(&coord);

        reg.register_auxiliary("aux1:3001").await.unwrap();
        reg.register_auxiliary("aux1:3001").await.unwrap();
        reg.register_auxiliary("aux2:3002").await.unwrap();

        assert_eq!(reg.auxiliaries().await.unwrap(), vec!["aux1:3001", "aux2:3002"]);
    }

    #[tokio::test]
    async fn test_watch_auxiliaries_sees_new_registrations() {
        let coord = MemoryCoordinator::new();
        let reg = registry(&coord);
        let cancel = CancellationToken::new();

        let mut rx = reg.watch_auxiliaries(cancel.clone()).await.unwrap();
        assert!(rx.recv().await.unwrap().is_empty());

        reg.register_auxiliary("aux1:3001").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec!["aux1:3001"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_broadcast_skips_self_and_reaches_peers() {
        let coord = MemoryCoordinator::new();
        let a = registry(&coord);
        let b = registry(&coord);
        let c = registry(&coord);

        a.register_master("a").await.unwrap();
        b.register_master("b").await.unwrap();
        c.register_master("c").await.unwrap();

        let cancel = CancellationToken::new();
        let mut inbox_a = a.removal_inbox(cancel.clone()).unwrap();
        let mut inbox_b = b.removal_inbox(cancel.clone()).unwrap();

        let notified = c.broadcast_removal("aux2:3002").await.unwrap();
        assert_eq!(notified, 2);

        assert_eq!(inbox_a.recv().await.unwrap(), "aux2:3002");
        assert_eq!(inbox_b.recv().await.unwrap(), "aux2:3002");

        // Delivered notices are cleared
        let observer = coord.session();
        for _ in 0..100 {
            if observer.get_data("/masters/master-a").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(observer.get_data("/masters/master-a").await.unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_inbox_requires_registration() {
        let coord = MemoryCoordinator::new();
        let reg = registry(&coord);
        assert!(reg.removal_inbox(CancellationToken::new()).is_err());
    }

    #[tokio::test]
    async fn test_master_node_disappears_with_session() {
        let coord = MemoryCoordinator::new();
        let observer = coord.session();
        {
            let reg = registry(&coord);
            reg.register_master("gone").await.unwrap();
            assert_eq!(
                observer.children("/masters").await.unwrap(),
                vec!["master-gone"]
            );
        }
        assert!(observer.children("/masters").await.unwrap().is_empty());
    }
}
