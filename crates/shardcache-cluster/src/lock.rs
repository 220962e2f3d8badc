//! Cluster-wide mutual exclusion
//!
//! Each contender creates an ephemeral sequential token under the lock
//! path. The holder is the contender with the lowest sequence number;
//! every other contender waits on the deletion of its immediate
//! predecessor only, so a release wakes exactly one waiter. A holder
//! whose session dies loses its token and with it the lock.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordination::{child_path, ensure_path, node_name, CoordinationService, CreateMode};
use crate::error::{ClusterError, ClusterResult};

const TOKEN_PREFIX: &str = "lock-";

/// A named lock backed by the coordination service
pub struct DistributedLock {
    coord: Arc<dyn CoordinationService>,
    lock_path: String,
    cancel: CancellationToken,
}

impl DistributedLock {
    pub fn new(coord: Arc<dyn CoordinationService>, lock_path: impl Into<String>) -> Self {
        Self {
            coord,
            lock_path: lock_path.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon pending waits when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    /// Block until this caller holds the lock, run `f`, then release.
    /// The token is removed on every exit path, including cancellation
    /// while waiting.
    pub async fn run_exclusive<F, Fut, T>(&self, f: F) -> ClusterResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.cancel.is_cancelled() {
            return Err(ClusterError::LockAbandoned(self.lock_path.clone()));
        }

        ensure_path(self.coord.as_ref(), &self.lock_path).await?;
        let token = self
            .coord
            .create(
                &child_path(&self.lock_path, TOKEN_PREFIX),
                Vec::new(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        debug!("Queued for lock {} as {}", self.lock_path, token);

        if let Err(e) = self.wait_turn(&token).await {
            self.release(&token).await;
            return Err(e);
        }

        debug!("Acquired lock {} with {}", self.lock_path, token);
        let output = f().await;
        self.release(&token).await;
        Ok(output)
    }

    async fn wait_turn(&self, token: &str) -> ClusterResult<()> {
        let own_name = node_name(token);

        loop {
            let mut contenders: Vec<String> = self
                .coord
                .children(&self.lock_path)
                .await?
                .into_iter()
                .filter(|name| name.starts_with(TOKEN_PREFIX))
                .collect();
            contenders.sort();

            let position = contenders
                .iter()
                .position(|name| name == own_name)
                .ok_or_else(|| ClusterError::CoordinationNoNode(token.to_string()))?;

            if position == 0 {
                return Ok(());
            }

            let predecessor = child_path(&self.lock_path, &contenders[position - 1]);
            let (data, watch) = self.coord.watch_data(&predecessor).await?;
            if data.is_none() {
                // Gone between listing and watching
                continue;
            }

            debug!("{} waiting on {}", own_name, predecessor);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(ClusterError::LockAbandoned(self.lock_path.clone()));
                }
                _ = watch.wait() => {}
            }
        }
    }

    async fn release(&self, token: &str) {
        match self.coord.delete(token).await {
            Ok(()) | Err(ClusterError::CoordinationNoNode(_)) => {
                debug!("Released {}", token);
            }
            Err(e) => warn!("Failed to release lock token {}: {}", token, e),
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinator;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn lock_for(coord: &MemoryCoordinator) -> DistributedLock {
        DistributedLock::new(Arc::new(coord.session()), "/remove-auxes")
    }

    #[tokio::test]
    async fn test_single_holder_runs_and_releases() {
        let coord = MemoryCoordinator::new();
        let lock = lock_for(&coord);

        let value = lock.run_exclusive(|| async { 7 }).await.unwrap();
        assert_eq!(value, 7);

        let observer = coord.session();
        assert!(observer.children("/remove-auxes").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_contenders_never_overlap() {
        let coord = MemoryCoordinator::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let lock = lock_for(&coord);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            let completed = Arc::clone(&completed);

            handles.push(tokio::spawn(async move {
                lock.run_exclusive(|| async move {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    completed.lock().push(i);
                })
                .await
                .unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(completed.lock().len(), 8);
    }

    #[tokio::test]
    async fn test_waiters_proceed_in_token_order() {
        let coord = MemoryCoordinator::new();
        let holder = Arc::new(lock_for(&coord));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = tokio::spawn({
            let holder = Arc::clone(&holder);
            async move {
                holder
                    .run_exclusive(|| async move {
                        let _ = entered_tx.send(());
                        let _ = release_rx.await;
                    })
                    .await
                    .unwrap();
            }
        });
        entered_rx.await.unwrap();

        let observer = coord.session();
        let mut waiters = Vec::new();
        for i in 0..3 {
            let lock = lock_for(&coord);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                lock.run_exclusive(|| async move { order.lock().push(i) })
                    .await
                    .unwrap();
            }));

            // Wait until this waiter's token is queued before starting the next
            loop {
                if observer.children("/remove-auxes").await.unwrap().len() == i + 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        release_tx.send(()).unwrap();
        first.await.unwrap();
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_crashed_holder_frees_lock() {
        let coord = MemoryCoordinator::new();

        // A session that took a token and then died
        let crashed = coord.session();
        ensure_path(&crashed, "/remove-auxes").await.unwrap();
        crashed
            .create("/remove-auxes/lock-", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();

        let lock = lock_for(&coord);
        let waiter = tokio::spawn(async move { lock.run_exclusive(|| async { "ran" }).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        crashed.close();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), "ran");
    }

    #[tokio::test]
    async fn test_cancel_abandons_wait_and_removes_token() {
        let coord = MemoryCoordinator::new();
        let holder = coord.session();
        ensure_path(&holder, "/remove-auxes").await.unwrap();
        holder
            .create("/remove-auxes/lock-", vec![], CreateMode::EphemeralSequential)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let lock = lock_for(&coord).with_cancellation(cancel.clone());
        let waiter = tokio::spawn(async move { lock.run_exclusive(|| async {}).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClusterError::LockAbandoned(_))));
        assert_eq!(holder.children("/remove-auxes").await.unwrap().len(), 1);
    }
}
