//! Redistribution of key-value batches to their current owners
//!
//! Handles:
//! - A bounded worker pool sized per batch
//! - Owner lookup at send time, against the ring as it is then
//! - Best-effort delivery: a failed pair is logged and dropped

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shardcache_core::types::{KeyValue, Mappings};

use crate::ring::HashRing;
use crate::transport::CacheTransport;

/// Configuration for the rebalance engine
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Ceiling on workers per batch
    pub max_workers: usize,
    /// Pairs buffered between the feeder and the workers
    pub queue_size: usize,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            max_workers: shardcache_core::MAX_REBALANCE_WORKERS,
            queue_size: 256,
        }
    }
}

/// Outcome counters, per batch or cumulative
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceStats {
    /// Pairs handed to a worker
    pub dispatched: u64,
    /// Pairs stored on their owner
    pub delivered: u64,
    /// Pairs dropped after a lookup or transport failure
    pub failed: u64,
}

impl RebalanceStats {
    fn merge(&mut self, other: &RebalanceStats) {
        self.dispatched += other.dispatched;
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

/// A batch whose pairs are all enqueued; sends may still be in flight
#[must_use = "dropping the handle detaches the batch"]
pub struct RebalanceHandle {
    dispatched: u64,
    workers: Vec<JoinHandle<RebalanceStats>>,
}

impl RebalanceHandle {
    fn empty() -> Self {
        Self {
            dispatched: 0,
            workers: Vec::new(),
        }
    }

    /// Pairs in this batch
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Wait for every send in the batch to finish
    pub async fn join(self) -> RebalanceStats {
        let mut stats = RebalanceStats {
            dispatched: self.dispatched,
            ..Default::default()
        };
        for worker in self.workers {
            match worker.await {
                Ok(worker_stats) => {
                    stats.delivered += worker_stats.delivered;
                    stats.failed += worker_stats.failed;
                }
                Err(e) => warn!("Rebalance worker panicked: {}", e),
            }
        }
        stats
    }

    /// Let the batch finish in the background
    pub fn detach(self) {}
}

/// The rebalance engine
pub struct RebalanceEngine {
    ring: Arc<HashRing>,
    transport: Arc<dyn CacheTransport>,
    config: RebalanceConfig,
    totals: Arc<RwLock<RebalanceStats>>,
}

impl RebalanceEngine {
    pub fn new(
        ring: Arc<HashRing>,
        transport: Arc<dyn CacheTransport>,
        config: RebalanceConfig,
    ) -> Self {
        Self {
            ring,
            transport,
            config,
            totals: Arc::new(RwLock::new(RebalanceStats::default())),
        }
    }

    /// Forward every pair of `mappings` to its current owner. Returns once
    /// all pairs are enqueued.
    pub async fn rebalance(&self, mappings: Mappings) -> RebalanceHandle {
        let total = mappings.len();
        if total == 0 {
            return RebalanceHandle::empty();
        }

        let worker_count = self.config.max_workers.max(1).min(total);
        let (tx, rx) = mpsc::channel::<KeyValue>(self.config.queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));

        info!(
            "Rebalancing {} pairs with {} workers",
            total, worker_count
        );

        let workers = (0..worker_count)
            .map(|id| self.spawn_worker(id, Arc::clone(&rx)))
            .collect();

        let mut dispatched = 0u64;
        for (key, value) in mappings {
            if tx.send(KeyValue { key, value }).await.is_err() {
                warn!("Rebalance workers exited early");
                break;
            }
            dispatched += 1;
        }
        drop(tx);

        self.totals.write().dispatched += dispatched;
        metrics::counter!("shardcache_rebalance_batches_total").increment(1);

        RebalanceHandle {
            dispatched,
            workers,
        }
    }

    /// Cumulative counters across every batch
    pub fn stats(&self) -> RebalanceStats {
        *self.totals.read()
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    fn spawn_worker(
        &self,
        id: usize,
        rx: Arc<Mutex<mpsc::Receiver<KeyValue>>>,
    ) -> JoinHandle<RebalanceStats> {
        let ring = Arc::clone(&self.ring);
        let transport = Arc::clone(&self.transport);
        let totals = Arc::clone(&self.totals);

        tokio::spawn(async move {
            let mut stats = RebalanceStats::default();

            loop {
                let next = rx.lock().await.recv().await;
                let Some(pair) = next else { break };

                let outcome = match ring.get_node(&pair.key) {
                    Ok(owner) => match transport.put(&owner, &pair).await {
                        Ok(()) => {
                            debug!("Moved key {} to {}", pair.key, owner);
                            true
                        }
                        Err(e) => {
                            warn!("Failed to move key {} to {}: {}", pair.key, owner, e);
                            false
                        }
                    },
                    Err(e) => {
                        warn!("No owner for key {}: {}", pair.key, e);
                        false
                    }
                };

                if outcome {
                    stats.delivered += 1;
                    metrics::counter!("shardcache_rebalance_pairs_total", "outcome" => "delivered")
                        .increment(1);
                } else {
                    stats.failed += 1;
                    metrics::counter!("shardcache_rebalance_pairs_total", "outcome" => "failed")
                        .increment(1);
                }
            }

            debug!("Rebalance worker {} done: {:?}", id, stats);
            totals.write().merge(&RebalanceStats {
                dispatched: 0,
                ..stats
            });
            stats
        })
    }
}

impl std::fmt::Debug for RebalanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceEngine")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
