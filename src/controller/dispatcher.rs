//! # Dispatcher
//!
//! A bounded pool of worker loops bound to one [`WorkQueue`] and one reconcile function.
//!
//! Workers pop a key, run the reconciler and decide what happens to the key:
//!
//! | Result | Next step |
//! |---|---|
//! | `Ok(Done)` | backoff reset, key dropped |
//! | `Ok(RequeueAfter(d))` | backoff reset, key re-added after `d` |
//! | `Ok(Retry)` | key re-added with its rate-limited backoff |
//! | `Err(Conflict)` | key re-added immediately (re-read on the next pass) |
//! | `Err(_)` | error counted, key re-added with its rate-limited backoff |
//!
//! Shutdown is driven by the queue: once it stops handing out keys, workers finish
//! their current reconcile and [`Dispatcher::run`] returns.

use crate::controller::queue::WorkQueue;
use crate::controller::types::{ReconcileAction, ReconcileError, TriggerSource};
use crate::observability::metrics;
use crate::store::ObjectKey;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// A reconcile function for one resource kind
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Kind label used in logs and metrics (`broker`, `instance`, ...)
    fn kind(&self) -> &'static str;

    /// Converge the record behind `key`; a missing record is not an error
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError>;
}

pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconcile>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kind", &self.reconciler.kind())
            .field("queue", &self.queue)
            .finish()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconcile>) -> Self {
        Self { queue, reconciler }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run `workers` worker loops until the queue shuts down
    pub async fn run(self, workers: usize) {
        let kind = self.reconciler.kind();
        let mut set = JoinSet::new();
        for worker_id in 0..workers.max(1) {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            set.spawn(async move {
                while let Some(key) = queue.get().await {
                    process_key(&queue, reconciler.as_ref(), &key).await;
                    queue.done(&key);
                }
                debug!(resource.kind = kind, worker_id, "worker stopped");
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(resource.kind = kind, "worker task failed: {}", e);
            }
        }
        debug!(resource.kind = kind, "dispatcher drained");
    }
}

async fn process_key(queue: &Arc<WorkQueue>, reconciler: &dyn Reconcile, key: &ObjectKey) {
    let kind = reconciler.kind();
    let start = Instant::now();
    metrics::increment_reconciliations(kind);

    let result = match AssertUnwindSafe(reconciler.reconcile(key)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::Transient(format!(
            "reconcile of {key} panicked"
        ))),
    };
    metrics::observe_reconciliation_duration(kind, start.elapsed().as_secs_f64());

    match result {
        Ok(ReconcileAction::Done) => queue.forget(key),
        Ok(ReconcileAction::RequeueAfter(delay)) => {
            queue.forget(key);
            metrics::increment_requeues(kind, TriggerSource::Timer.as_str());
            queue.add_after(key.clone(), delay);
        }
        Ok(ReconcileAction::Retry) => {
            metrics::increment_requeues(kind, TriggerSource::ErrorBackoff.as_str());
            let delay = queue.add_rate_limited(key.clone());
            debug!(resource.kind = kind, resource.key = %key, delay_ms = delay.as_millis(), "retrying");
        }
        Err(e) if e.is_conflict() => {
            debug!(resource.kind = kind, resource.key = %key, "write conflict, requeueing: {}", e);
            metrics::increment_requeues(kind, TriggerSource::Conflict.as_str());
            queue.add(key.clone());
        }
        Err(e) => {
            metrics::increment_reconciliation_errors(kind);
            metrics::increment_requeues(kind, TriggerSource::ErrorBackoff.as_str());
            let delay = queue.add_rate_limited(key.clone());
            warn!(
                resource.kind = kind,
                resource.key = %key,
                delay_ms = delay.as_millis(),
                "reconcile failed, retrying with backoff: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails each key a fixed number of times, tracking concurrency per key
    struct FlakyReconciler {
        failures_before_success: usize,
        attempts: Mutex<HashMap<ObjectKey, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        conflict_first: bool,
    }

    impl FlakyReconciler {
        fn new(failures_before_success: usize) -> Self {
            Self {
                failures_before_success,
                attempts: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                conflict_first: false,
            }
        }

        fn attempts(&self, key: &ObjectKey) -> usize {
            self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Reconcile for FlakyReconciler {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let entry = attempts.entry(key.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if self.conflict_first && attempt == 1 {
                return Err(ReconcileError::Conflict("stale".to_string()));
            }
            if attempt <= self.failures_before_success {
                return Err(ReconcileError::Transient(format!("attempt {attempt}")));
            }
            Ok(ReconcileAction::Done)
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_errors_are_retried_until_success() {
        let queue = WorkQueue::new("flaky", Duration::from_millis(1), Duration::from_millis(5));
        let reconciler = Arc::new(FlakyReconciler::new(3));
        let dispatcher = Dispatcher::new(Arc::clone(&queue), Arc::<FlakyReconciler>::clone(&reconciler));
        let handle = tokio::spawn(dispatcher.run(2));

        let key = ObjectKey::new("default", "a");
        queue.add(key.clone());
        wait_for(|| reconciler.attempts(&key) == 4).await;
        wait_for(|| !queue.has_failures(&key)).await;

        queue.shutdown();
        handle.await.unwrap();
        assert_eq!(reconciler.attempts(&key), 4);
    }

    #[tokio::test]
    async fn test_conflicts_requeue_immediately() {
        let queue = WorkQueue::new("flaky", Duration::from_secs(60), Duration::from_secs(60));
        let mut reconciler = FlakyReconciler::new(0);
        reconciler.conflict_first = true;
        let reconciler = Arc::new(reconciler);
        let handle = tokio::spawn(Dispatcher::new(Arc::clone(&queue), Arc::<FlakyReconciler>::clone(&reconciler)).run(1));

        let key = ObjectKey::new("default", "a");
        queue.add(key.clone());
        // a 60s error backoff would stall the test; conflicts bypass it
        wait_for(|| reconciler.attempts(&key) == 2).await;

        queue.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_one_key_never_reconciles_concurrently() {
        let queue = WorkQueue::new("flaky", Duration::from_millis(1), Duration::from_millis(1));
        let reconciler = Arc::new(FlakyReconciler::new(0));
        let handle = tokio::spawn(Dispatcher::new(Arc::clone(&queue), Arc::<FlakyReconciler>::clone(&reconciler)).run(4));

        let key = ObjectKey::new("default", "a");
        for _ in 0..20 {
            queue.add(key.clone());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        wait_for(|| queue.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.shutdown();
        handle.await.unwrap();
        assert_eq!(reconciler.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_reconcile_in_parallel() {
        let queue = WorkQueue::new("flaky", Duration::from_millis(1), Duration::from_millis(1));
        let reconciler = Arc::new(FlakyReconciler::new(0));
        let handle = tokio::spawn(Dispatcher::new(Arc::clone(&queue), Arc::<FlakyReconciler>::clone(&reconciler)).run(4));

        for name in ["a", "b", "c", "d"] {
            queue.add(ObjectKey::new("default", name));
        }
        wait_for(|| {
            ["a", "b", "c", "d"]
                .iter()
                .all(|n| reconciler.attempts(&ObjectKey::new("default", *n)) == 1)
        })
        .await;

        queue.shutdown();
        handle.await.unwrap();
        assert!(reconciler.max_in_flight.load(Ordering::SeqCst) > 1);
    }
}
