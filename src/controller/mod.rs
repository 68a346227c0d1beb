//! Reconciliation controllers
//!
//! Each controller owns one queue fed by informer events and drained by a
//! single worker, so syncs of the same resource never interleave.

pub mod applier;
pub mod events;
pub mod pruner;
pub mod queue;
pub mod registry;

pub use applier::StorageApplier;
pub use events::EventHandler;
pub use pruner::PrunerController;
pub use queue::WorkQueue;
pub use registry::{bootstrap_config, RegistryController};

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// What happens to the key after a successful sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Nothing to do until the next event
    AwaitChange,
    /// Sync again after the delay even without events
    RequeueAfter(Duration),
}

/// Log a failed write of `resource`; conflicts are routine and retried
pub(crate) fn log_write_error(resource: &'static str, what: &'static str) -> impl Fn(Error) -> Error {
    move |e| {
        if e.is_conflict() {
            debug!(resource, write = what, error = %e, "changed underneath, retrying");
        } else {
            error!(resource, write = what, error = %e, "unable to update");
        }
        e
    }
}

/// One sync pass over a controller's singleton resource
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn sync(&self) -> Result<SyncAction>;
}

/// Drain `queue` until it is shut down. Failed syncs are requeued with
/// backoff; a successful sync resets the key's backoff.
pub async fn run_worker(queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconciler>) {
    info!(controller = reconciler.name(), "worker started");
    while let Some(key) = queue.get().await {
        match reconciler.sync().await {
            Ok(SyncAction::AwaitChange) => queue.forget(&key),
            Ok(SyncAction::RequeueAfter(delay)) => {
                queue.forget(&key);
                queue.add_after(&key, delay);
                debug!(
                    controller = reconciler.name(),
                    key = %key,
                    delay_ms = delay.as_millis() as u64,
                    "sync scheduled"
                );
            }
            Err(e) => {
                let delay = queue.add_rate_limited(&key);
                debug!(
                    controller = reconciler.name(),
                    key = %key,
                    error = %e,
                    requeues = queue.num_requeues(&key),
                    delay_ms = delay.as_millis() as u64,
                    "sync failed, requeued"
                );
            }
        }
        queue.done(&key);
    }
    info!(controller = reconciler.name(), "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn sync(&self) -> Result<SyncAction> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::Internal("not yet".into()))
            } else {
                Ok(SyncAction::AwaitChange)
            }
        }
    }

    /// Asks to be synced again once, after a delay
    struct Recheck {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for Recheck {
        fn name(&self) -> &'static str {
            "recheck"
        }

        async fn sync(&self) -> Result<SyncAction> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(SyncAction::RequeueAfter(self.delay))
            } else {
                Ok(SyncAction::AwaitChange)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_retries_until_success() {
        let queue = WorkQueue::new("flaky", Duration::from_millis(5), Duration::from_secs(1));
        let reconciler = Arc::new(Flaky {
            failures: 3,
            calls: AtomicUsize::new(0),
        });
        let worker = tokio::spawn(run_worker(queue.clone(), reconciler.clone()));

        queue.add("cluster");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 4);
        assert_eq!(queue.num_requeues("cluster"), 0);

        queue.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_requeues_after_delay() {
        let queue = WorkQueue::new("recheck", Duration::from_millis(5), Duration::from_secs(1));
        let reconciler = Arc::new(Recheck {
            delay: Duration::from_secs(41),
            calls: AtomicUsize::new(0),
        });
        let worker = tokio::spawn(run_worker(queue.clone(), reconciler.clone()));

        queue.add("cluster");
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.num_requeues("cluster"), 0);

        queue.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let queue = WorkQueue::new("idle", Duration::from_millis(5), Duration::from_secs(1));
        let reconciler = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let worker = tokio::spawn(run_worker(queue.clone(), reconciler.clone()));
        tokio::task::yield_now().await;

        queue.shutdown();
        worker.await.unwrap();
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 0);
    }
}
