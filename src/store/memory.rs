//! # In-Memory Store
//!
//! [`ObjectStore`] implementation that keeps records in process. It follows the
//! API server's bookkeeping closely enough for the controller not to notice:
//! resourceVersion preconditions, generation bumps on spec edits, status
//! subresource isolation, and finalizer-gated deletion.

use super::{ObjectKey, ObjectStore, StoreError, StoredResource, WatchEvent};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const WATCH_BUFFER: usize = 1024;

struct MemoryState<K> {
    objects: BTreeMap<ObjectKey, K>,
    next_version: u64,
}

/// Store for one kind, held in memory
pub struct MemoryStore<K: StoredResource> {
    state: Mutex<MemoryState<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K: StoredResource> std::fmt::Debug for MemoryStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K: StoredResource> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StoredResource> MemoryStore<K> {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            state: Mutex::new(MemoryState {
                objects: BTreeMap::new(),
                next_version: 1,
            }),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState<K>> {
        // A panic while holding the lock cannot leave the map half-written
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn publish(&self, event: WatchEvent<K>) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl<K> MemoryState<K> {
    fn bump_version(&mut self) -> String {
        let version = self.next_version;
        self.next_version += 1;
        version.to_string()
    }
}

fn now_time() -> Result<Time, StoreError> {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    Ok(serde_json::from_value(Value::String(now))?)
}

/// Everything except metadata and status
fn spec_view<K: StoredResource>(obj: &K) -> Result<Value, StoreError> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    Ok(value)
}

/// Copy `status` from `source` onto `target`
fn with_status_of<K: StoredResource>(target: &K, source: &K) -> Result<K, StoreError> {
    let mut target_value = serde_json::to_value(target)?;
    let source_value = serde_json::to_value(source)?;
    if let Some(map) = target_value.as_object_mut() {
        match source_value.get("status") {
            Some(status) if !status.is_null() => {
                map.insert("status".to_string(), status.clone());
            }
            _ => {
                map.remove("status");
            }
        }
    }
    Ok(serde_json::from_value(target_value)?)
}

fn check_version<K: StoredResource>(
    stored: &K,
    incoming: &K,
    key: &ObjectKey,
) -> Result<(), StoreError> {
    match incoming.resource_version() {
        Some(version) if Some(&version) != stored.resource_version().as_ref() => {
            Err(StoreError::Conflict(key.to_string()))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl<K: StoredResource> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>, StoreError> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        let created = {
            let mut state = self.lock();
            if state.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            let mut created = obj.clone();
            let version = state.bump_version();
            let meta = created.meta_mut();
            meta.namespace = Some(key.namespace.clone());
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
            meta.resource_version = Some(version);
            meta.generation = Some(1);
            meta.creation_timestamp = Some(now_time()?);
            meta.deletion_timestamp = None;
            state.objects.insert(key, created.clone());
            created
        };
        self.publish(WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        let event = {
            let mut state = self.lock();
            let stored = state
                .objects
                .get(&key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            check_version(stored, obj, &key)?;

            let spec_changed = spec_view(stored)? != spec_view(obj)?;
            let mut updated = with_status_of(obj, stored)?;
            let stored_meta = stored.meta().clone();
            let version = state.bump_version();
            let meta = updated.meta_mut();
            meta.namespace = Some(key.namespace.clone());
            meta.uid = stored_meta.uid;
            meta.creation_timestamp = stored_meta.creation_timestamp;
            meta.deletion_timestamp = stored_meta.deletion_timestamp;
            meta.resource_version = Some(version);
            meta.generation = stored_meta
                .generation
                .map(|g| if spec_changed { g + 1 } else { g });

            let released = meta.deletion_timestamp.is_some()
                && meta.finalizers.as_ref().is_none_or(Vec::is_empty);
            if released {
                state.objects.remove(&key);
                WatchEvent::Deleted(updated)
            } else {
                state.objects.insert(key, updated.clone());
                WatchEvent::Applied(updated)
            }
        };
        let result = event.object().clone();
        self.publish(event);
        Ok(result)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        let updated = {
            let mut state = self.lock();
            let stored = state
                .objects
                .get(&key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            check_version(stored, obj, &key)?;
            let mut updated = with_status_of(stored, obj)?;
            let version = state.bump_version();
            updated.meta_mut().resource_version = Some(version);
            state.objects.insert(key, updated.clone());
            updated
        };
        self.publish(WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let event = {
            let mut state = self.lock();
            let Some(stored) = state.objects.get(key).cloned() else {
                return Ok(());
            };
            let has_finalizers = stored.finalizers().iter().any(|f| !f.is_empty());
            if has_finalizers {
                if stored.meta().deletion_timestamp.is_some() {
                    return Ok(());
                }
                let mut marked = stored;
                let version = state.bump_version();
                marked.meta_mut().deletion_timestamp = Some(now_time()?);
                marked.meta_mut().resource_version = Some(version);
                state.objects.insert(key.clone(), marked.clone());
                WatchEvent::Applied(marked)
            } else {
                state.objects.remove(key);
                WatchEvent::Deleted(stored)
            }
        };
        self.publish(event);
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent<K>> {
        // Snapshot and subscribe under one lock so no event falls in between
        let (snapshot, receiver) = {
            let state = self.lock();
            let snapshot: Vec<WatchEvent<K>> = state
                .objects
                .values()
                .cloned()
                .map(WatchEvent::Applied)
                .collect();
            (snapshot, self.events.subscribe())
        };
        let live = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(event) => Some((event, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed events cannot be replayed; end the stream so the
                    // watcher restarts from a fresh snapshot
                    tracing::warn!(
                        "in-memory watch lagged, skipped {} events; forcing a relist",
                        skipped
                    );
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        stream::iter(snapshot).chain(live).boxed()
    }
}
