//! # Object Store
//!
//! The watch + CRUD contract the controller consumes. Records are versioned by
//! `metadata.generation` (bumped on spec edits) and `metadata.resourceVersion`
//! (bumped on every write); a write carrying a stale resourceVersion fails with
//! [`StoreError::Conflict`] and must be retried after a fresh read.
//!
//! Two implementations are provided:
//! - [`KubeStore`] - backed by the Kubernetes API server
//! - [`MemoryStore`] - in-process, used by tests and local runs

mod kube_api;
mod memory;

pub use kube_api::KubeStore;
pub use memory::MemoryStore;

use crate::crd::{ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan};
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Namespace + name of a record; also the work-queue key (`namespace/name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a stored object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(
            obj.namespace().unwrap_or_else(|| "default".to_string()),
            obj.name_any(),
        )
    }

    /// Parse a `namespace/name` queue key
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let (namespace, name) = key.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Watch notification
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Created or modified (including deletion requests that are held by finalizers)
    Applied(K),
    /// Removed from the store
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            Self::Applied(obj) | Self::Deleted(obj) => obj,
        }
    }
}

/// Object store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    /// Optimistic-concurrency failure: the write carried a stale resourceVersion
    #[error("conflict writing {0}: the object has been modified")]
    Conflict(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Types that can live in an [`ObjectStore`]
pub trait StoredResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + fmt::Debug
        + Send
        + Sync
        + 'static
{
}

/// Watch + CRUD contract for one resource kind
#[async_trait]
pub trait ObjectStore<K: StoredResource>: Send + Sync {
    /// Fetch a record; `Ok(None)` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, StoreError>;

    /// All records of the kind in one namespace
    async fn list(&self, namespace: &str) -> Result<Vec<K>, StoreError>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace metadata and spec; status is ignored
    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace status only
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;

    /// Request deletion; records holding finalizers are only marked for deletion.
    /// Deleting an absent record succeeds.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Event stream for every namespace, starting with the current contents
    fn watch(&self) -> BoxStream<'static, WatchEvent<K>>;
}

pub type SharedStore<K> = Arc<dyn ObjectStore<K>>;

/// One store per kind the controller touches
#[derive(Clone)]
pub struct Stores {
    pub brokers: SharedStore<ServiceBroker>,
    pub classes: SharedStore<ServiceClass>,
    pub plans: SharedStore<ServicePlan>,
    pub instances: SharedStore<ServiceInstance>,
    pub bindings: SharedStore<ServiceBinding>,
    pub secrets: SharedStore<Secret>,
}

impl fmt::Debug for Stores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

impl Stores {
    /// Stores backed by the Kubernetes API server
    pub fn kube(client: &kube::Client) -> Self {
        Self {
            brokers: Arc::new(KubeStore::new(client.clone())),
            classes: Arc::new(KubeStore::new(client.clone())),
            plans: Arc::new(KubeStore::new(client.clone())),
            instances: Arc::new(KubeStore::new(client.clone())),
            bindings: Arc::new(KubeStore::new(client.clone())),
            secrets: Arc::new(KubeStore::new(client.clone())),
        }
    }

    /// Empty in-memory stores
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            brokers: Arc::new(MemoryStore::new()),
            classes: Arc::new(MemoryStore::new()),
            plans: Arc::new(MemoryStore::new()),
            instances: Arc::new(MemoryStore::new()),
            bindings: Arc::new(MemoryStore::new()),
            secrets: Arc::new(MemoryStore::new()),
        }
    }
}

/// Whether deletion was requested for a record
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}
