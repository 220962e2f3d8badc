//! Liveness tracking of auxiliary nodes
//!
//! Every tracked node gets its own probe loop. Each completed probe emits
//! one [`MembershipEvent`]; deduplicating repeated states is left to the
//! consumer. Loops for different nodes never wait on each other, so one
//! slow node does not delay detection of another.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use shardcache_core::types::NodeId;

use crate::transport::CacheTransport;

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Alive(NodeId),
    Dead(NodeId),
}

impl MembershipEvent {
    pub fn node(&self) -> &str {
        match self {
            MembershipEvent::Alive(node) | MembershipEvent::Dead(node) => node,
        }
    }
}

/// Spawns and owns the per-node probe loops
pub struct MembershipTracker {
    transport: Arc<dyn CacheTransport>,
    /// Delay between two probes of the same node
    interval: Duration,
    event_tx: mpsc::Sender<MembershipEvent>,
    /// Nodes with a running probe loop
    tracked: Arc<RwLock<HashSet<NodeId>>>,
    shutdown: CancellationToken,
}

impl MembershipTracker {
    pub fn new(
        transport: Arc<dyn CacheTransport>,
        interval: Duration,
        event_tx: mpsc::Sender<MembershipEvent>,
    ) -> Self {
        Self {
            transport,
            interval,
            event_tx,
            tracked: Arc::new(RwLock::new(HashSet::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Begin probing the statically configured nodes
    pub fn start<I>(&self, nodes: I)
    where
        I: IntoIterator<Item = NodeId>,
    {
        info!(
            "Starting membership tracker (probe interval {:?})",
            self.interval
        );
        for node in nodes {
            self.track(node);
        }
    }

    /// Start probing `node`. Returns false if it is already tracked or the
    /// tracker has been stopped.
    pub fn track(&self, node: impl Into<NodeId>) -> bool {
        let node = node.into();
        if self.shutdown.is_cancelled() || !self.tracked.write().insert(node.clone()) {
            return false;
        }

        debug!("Tracking liveness of {}", node);
        self.spawn_probe_loop(node);
        true
    }

    /// Nodes currently probed, sorted
    pub fn tracked(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.tracked.read().iter().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Stop all probe loops. A probe already in flight completes; no new
    /// probe starts.
    pub fn stop(&self) {
        info!("Stopping membership tracker");
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn spawn_probe_loop(&self, node: NodeId) {
        let transport = Arc::clone(&self.transport);
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    break;
                }

                let event = match transport.probe(&node).await {
                    Ok(()) => {
                        metrics::counter!("shardcache_probes_total", "outcome" => "alive")
                            .increment(1);
                        MembershipEvent::Alive(node.clone())
                    }
                    Err(e) => {
                        debug!("Probe of {} failed: {}", node, e);
                        metrics::counter!("shardcache_probes_total", "outcome" => "dead")
                            .increment(1);
                        MembershipEvent::Dead(node.clone())
                    }
                };

                if event_tx.send(event).await.is_err() {
                    break;
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            debug!("Probe loop for {} stopped", node);
        });
    }
}

impl Drop for MembershipTracker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for MembershipTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipTracker")
            .field("interval", &self.interval)
            .field("tracked", &self.tracked())
            .finish()
    }
}
