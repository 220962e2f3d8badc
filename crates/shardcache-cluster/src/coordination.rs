//! Coordination service abstraction
//!
//! A hierarchical namespace of small nodes with ephemeral and
//! sequential variants and one-shot watches, as offered by
//! ZooKeeper-style services. Masters use it for auxiliary registration,
//! peer discovery and the distributed lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ClusterError, ClusterResult};

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Deleted when the creating session ends
    Ephemeral,
    /// Ephemeral, with a monotonically increasing 10-digit suffix
    /// appended to the requested name
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        !matches!(self, CreateMode::Persistent)
    }
}

/// What triggered a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    NodeCreated(String),
    NodeDeleted(String),
    DataChanged(String),
    ChildrenChanged(String),
    /// The session that armed the watch is gone
    SessionClosed,
}

/// A one-shot watch. Fires at most once.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    pub fn new(rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the watch to fire. A dropped sender is reported as
    /// [`WatchEvent::SessionClosed`].
    pub async fn wait(self) -> WatchEvent {
        self.rx.await.unwrap_or(WatchEvent::SessionClosed)
    }
}

/// Client view of a coordination service session
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Create `path`; returns the actual path, which differs from the
    /// requested one for sequential nodes
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> ClusterResult<String>;

    async fn delete(&self, path: &str) -> ClusterResult<()>;

    async fn exists(&self, path: &str) -> ClusterResult<bool>;

    /// Names (not full paths) of the direct children of `path`, sorted
    async fn children(&self, path: &str) -> ClusterResult<Vec<String>>;

    async fn get_data(&self, path: &str) -> ClusterResult<Vec<u8>>;

    async fn set_data(&self, path: &str, data: Vec<u8>) -> ClusterResult<()>;

    /// Children of `path` plus a watch that fires on the next change to
    /// the child set or on deletion of `path`
    async fn watch_children(&self, path: &str) -> ClusterResult<(Vec<String>, Watch)>;

    /// Data of `path` (`None` if absent) plus a watch that fires when
    /// `path` is created, deleted or has its data changed
    async fn watch_data(&self, path: &str) -> ClusterResult<(Option<Vec<u8>>, Watch)>;
}

/// Create every missing component of `path` as a persistent node
pub async fn ensure_path(coord: &dyn CoordinationService, path: &str) -> ClusterResult<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);

        match coord
            .create(&current, Vec::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) | Err(ClusterError::CoordinationNodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Join a parent path and a child name
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Last path component
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Follow the child set of `path`, re-arming the watch after every
/// notification. The current child list is sent once up front and again
/// after each change. The stream ends when `cancel` fires, the receiver
/// is dropped, or the session closes.
pub fn watch_children_stream(
    coord: Arc<dyn CoordinationService>,
    path: String,
    cancel: CancellationToken,
) -> mpsc::Receiver<Vec<String>> {
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let watch = match coord.watch_children(&path).await {
                Ok((children, watch)) => {
                    if tx.send(children).await.is_err() {
                        break;
                    }
                    watch
                }
                Err(e) => {
                    warn!("Failed to watch children of {}: {}", path, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = watch.wait() => event,
            };

            if event == WatchEvent::SessionClosed {
                warn!("Coordination session closed while watching {}", path);
                break;
            }
            debug!("Watch on {} fired: {:?}", path, event);
        }

        debug!("Children watch on {} stopped", path);
    });

    rx
}
