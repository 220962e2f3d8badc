//! In-process coordination service
//!
//! A single namespace shared by any number of sessions. Closing (or
//! dropping) a session deletes the ephemeral nodes it created and fires
//! the watches those deletions trigger, which is how a crashed lock
//! holder or registrant disappears from the tree.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::coordination::{CoordinationService, CreateMode, Watch, WatchEvent};
use crate::error::{ClusterError, ClusterResult};

type SessionId = u64;

type WatchMap = HashMap<String, Vec<(SessionId, oneshot::Sender<WatchEvent>)>>;

#[derive(Debug)]
struct ZNode {
    data: Vec<u8>,
    ephemeral_owner: Option<SessionId>,
    /// Next sequence number handed to a sequential child
    next_sequence: u64,
}

impl ZNode {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            ephemeral_owner,
            next_sequence: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Namespace {
    nodes: BTreeMap<String, ZNode>,
    data_watches: WatchMap,
    child_watches: WatchMap,
}

impl Namespace {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), ZNode::new(Vec::new(), None));
        Self {
            nodes,
            ..Default::default()
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    /// Register a watch on `path`, first dropping every watch whose
    /// [`Watch`] handle is gone
    fn arm(
        watches: &mut WatchMap,
        path: &str,
        session: SessionId,
        tx: oneshot::Sender<WatchEvent>,
    ) {
        for senders in watches.values_mut() {
            senders.retain(|(_, tx)| !tx.is_closed());
        }
        watches.retain(|_, senders| !senders.is_empty());

        watches.entry(path.to_string()).or_default().push((session, tx));
    }

    fn fire(watches: &mut WatchMap, path: &str, event: WatchEvent) {
        if let Some(senders) = watches.remove(path) {
            for (_, tx) in senders {
                let _ = tx.send(event.clone());
            }
        }
    }

    fn fire_data(&mut self, path: &str, event: WatchEvent) {
        Self::fire(&mut self.data_watches, path, event);
    }

    fn fire_children(&mut self, path: &str) {
        Self::fire(
            &mut self.child_watches,
            path,
            WatchEvent::ChildrenChanged(path.to_string()),
        );
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            self.fire_data(path, WatchEvent::NodeDeleted(path.to_string()));
            Self::fire(
                &mut self.child_watches,
                path,
                WatchEvent::NodeDeleted(path.to_string()),
            );
            self.fire_children(parent_of(path));
        }
    }

    fn close_session(&mut self, session: SessionId) -> usize {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();

        for path in &owned {
            self.remove(path);
        }

        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for senders in watches.values_mut() {
                let (closed, open): (Vec<_>, Vec<_>) =
                    senders.drain(..).partition(|(owner, _)| *owner == session);
                *senders = open;
                for (_, tx) in closed {
                    let _ = tx.send(WatchEvent::SessionClosed);
                }
            }
            watches.retain(|_, senders| !senders.is_empty());
        }

        owned.len()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn validate_path(path: &str) -> ClusterResult<()> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(ClusterError::InvalidConfig(format!(
            "invalid coordination path {:?}",
            path
        )))
    }
}

/// Shared namespace. Hand out one [`MemorySession`] per participant.
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    namespace: Arc<Mutex<Namespace>>,
    next_session: Arc<AtomicU64>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            namespace: Arc::new(Mutex::new(Namespace::new())),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a new session against the shared namespace
    pub fn session(&self) -> MemorySession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        debug!("Opened coordination session {}", id);
        MemorySession {
            id,
            namespace: Arc::clone(&self.namespace),
            closed: AtomicBool::new(false),
        }
    }
}

/// One client session. Dropping it closes the session.
#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    namespace: Arc<Mutex<Namespace>>,
    closed: AtomicBool,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// End the session, deleting its ephemeral nodes
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let removed = self.namespace.lock().close_session(self.id);
        debug!(
            "Closed coordination session {} ({} ephemeral nodes removed)",
            self.id, removed
        );
    }

    fn check_open(&self) -> ClusterResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClusterError::CoordinationUnavailable(format!(
                "session {} is closed",
                self.id
            )))
        } else {
            Ok(())
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl CoordinationService for MemorySession {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> ClusterResult<String> {
        self.check_open()?;
        validate_path(path)?;
        if path == "/" {
            return Err(ClusterError::CoordinationNodeExists(path.to_string()));
        }

        let mut ns = self.namespace.lock();
        let parent = parent_of(path).to_string();

        let actual = {
            let parent_node = ns
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| ClusterError::CoordinationNoNode(parent.clone()))?;

            if parent_node.ephemeral_owner.is_some() {
                return Err(ClusterError::InvalidConfig(format!(
                    "ephemeral node {} cannot have children",
                    parent
                )));
            }

            if mode == CreateMode::EphemeralSequential {
                let seq = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                format!("{}{:010}", path, seq)
            } else {
                path.to_string()
            }
        };

        if ns.nodes.contains_key(&actual) {
            return Err(ClusterError::CoordinationNodeExists(actual));
        }

        let owner = mode.is_ephemeral().then_some(self.id);
        ns.nodes.insert(actual.clone(), ZNode::new(data, owner));
        ns.fire_data(&actual, WatchEvent::NodeCreated(actual.clone()));
        ns.fire_children(&parent);

        Ok(actual)
    }

    async fn delete(&self, path: &str) -> ClusterResult<()> {
        self.check_open()?;
        validate_path(path)?;

        let mut ns = self.namespace.lock();
        if !ns.nodes.contains_key(path) {
            return Err(ClusterError::CoordinationNoNode(path.to_string()));
        }
        if !ns.children_of(path).is_empty() {
            return Err(ClusterError::Internal(format!("node {} has children", path)));
        }

        ns.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> ClusterResult<bool> {
        self.check_open()?;
        Ok(self.namespace.lock().nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> ClusterResult<Vec<String>> {
        self.check_open()?;
        let ns = self.namespace.lock();
        if !ns.nodes.contains_key(path) {
            return Err(ClusterError::CoordinationNoNode(path.to_string()));
        }
        Ok(ns.children_of(path))
    }

    async fn get_data(&self, path: &str) -> ClusterResult<Vec<u8>> {
        self.check_open()?;
        self.namespace
            .lock()
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| ClusterError::CoordinationNoNode(path.to_string()))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> ClusterResult<()> {
        self.check_open()?;
        let mut ns = self.namespace.lock();
        let node = ns
            .nodes
            .get_mut(path)
            .ok_or_else(|| ClusterError::CoordinationNoNode(path.to_string()))?;
        node.data = data;
        ns.fire_data(path, WatchEvent::DataChanged(path.to_string()));
        Ok(())
    }

    async fn watch_children(&self, path: &str) -> ClusterResult<(Vec<String>, Watch)> {
        self.check_open()?;
        let mut ns = self.namespace.lock();
        if !ns.nodes.contains_key(path) {
            return Err(ClusterError::CoordinationNoNode(path.to_string()));
        }

        let children = ns.children_of(path);
        let (tx, rx) = oneshot::channel();
        Namespace::arm(&mut ns.child_watches, path, self.id, tx);

        Ok((children, Watch::new(rx)))
    }

    async fn watch_data(&self, path: &str) -> ClusterResult<(Option<Vec<u8>>, Watch)> {
        self.check_open()?;
        validate_path(path)?;
        let mut ns = self.namespace.lock();

        let data = ns.nodes.get(path).map(|n| n.data.clone());
        let (tx, rx) = oneshot::channel();
        Namespace::arm(&mut ns.data_watches, path, self.id, tx);

        Ok((data, Watch::new(rx)))
    }
}
