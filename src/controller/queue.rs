//! # Work Queue
//!
//! Per-kind, per-key deduplicating queue.
//!
//! - A key is held at most once while waiting.
//! - A key handed to a worker is "processing"; adding it again marks it dirty and it
//!   is re-queued by [`WorkQueue::done`], so one key never reconciles concurrently.
//! - Failed keys are re-added through [`WorkQueue::add_rate_limited`] with a per-key
//!   capped exponential backoff that [`WorkQueue::forget`] resets.
//! - After [`WorkQueue::shutdown`] no key is handed out and adds are ignored.

use crate::controller::backoff::ExponentialBackoff;
use crate::observability::metrics;
use crate::store::ObjectKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, ExponentialBackoff>,
    shutting_down: bool,
}

pub struct WorkQueue {
    kind: &'static str,
    backoff_start: Duration,
    backoff_max: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    #[must_use]
    pub fn new(kind: &'static str, backoff_start: Duration, backoff_max: Duration) -> Arc<Self> {
        Arc::new(Self {
            kind,
            backoff_start,
            backoff_max,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a key unless it is already waiting
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.waiting.push_back(key);
            metrics::set_queue_depth(self.kind, state.waiting.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueue a key after its next backoff delay; returns the delay used
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) -> Duration {
        let delay = {
            let mut state = self.lock();
            state
                .failures
                .entry(key.clone())
                .or_insert_with(|| ExponentialBackoff::new(self.backoff_start, self.backoff_max))
                .next_backoff()
        };
        debug!(resource.kind = self.kind, resource.key = %key, delay_ms = delay.as_millis(), "rate-limited requeue");
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure backoff of a key
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    /// Whether the key failed since it was last forgotten
    #[must_use]
    pub fn has_failures(&self, key: &ObjectKey) -> bool {
        self.lock().failures.contains_key(key)
    }

    /// Wait for the next key; `None` once the queue is shutting down
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.waiting.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    metrics::set_queue_depth(self.kind, state.waiting.len());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a key finished; re-queues it if it was added while processing
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutting_down && state.queued.insert(key.clone()) {
            state.waiting.push_back(key.clone());
            metrics::set_queue_depth(self.kind, state.waiting.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys waiting to be handed out
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new("test", Duration::from_millis(10), Duration::from_millis(40))
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    #[tokio::test]
    async fn test_duplicate_adds_are_collapsed() {
        let q = queue();
        q.add(key("a"));
        q.add(key("a"));
        q.add(key("b"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(key("a")));
        assert_eq!(q.get().await, Some(key("b")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_after_done() {
        let q = queue();
        q.add(key("a"));
        let k = q.get().await;
        assert_eq!(k, Some(key("a")));

        q.add(key("a"));
        assert!(q.is_empty(), "in-flight key must not be handed out twice");

        q.done(&key("a"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_done_without_dirty_does_not_requeue() {
        let q = queue();
        q.add(key("a"));
        let _ = q.get().await;
        q.done(&key("a"));
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_delays_grow_until_forgotten() {
        let q = queue();
        assert_eq!(q.add_rate_limited(key("a")), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited(key("a")), Duration::from_millis(20));
        assert_eq!(q.add_rate_limited(key("a")), Duration::from_millis(40));
        assert_eq!(q.add_rate_limited(key("a")), Duration::from_millis(40));
        assert!(q.has_failures(&key("a")));

        q.forget(&key("a"));
        assert!(!q.has_failures(&key("a")));
        assert_eq!(q.add_rate_limited(key("a")), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delivers_once_delay_elapses() {
        let q = queue();
        q.add_after(key("a"), Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(q.is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(q.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiting_workers() {
        let q = queue();
        let worker = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        let result = worker.await.unwrap_or(Some(key("unexpected")));
        assert_eq!(result, None);

        q.add(key("a"));
        assert!(q.is_empty(), "adds after shutdown are ignored");
    }
}
