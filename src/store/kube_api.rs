//! # Kubernetes Store
//!
//! [`ObjectStore`] implementation over the Kubernetes API server.

use super::{ObjectKey, ObjectStore, StoreError, StoredResource, WatchEvent};
use crate::constants::CONTROLLER_NAME;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use std::marker::PhantomData;
use tracing::{debug, error};

/// Store for one kind, talking to the API server directly
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> std::fmt::Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K: StoredResource> KubeStore<K> {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map API-server status codes onto the store taxonomy
fn map_error(err: kube::Error, key: &ObjectKey) -> StoreError {
    match err {
        kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound(key.to_string()),
        kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(key.to_string())
        }
        kube::Error::Api(api_err) if api_err.code == 409 => StoreError::Conflict(key.to_string()),
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl<K: StoredResource> ObjectStore<K> for KubeStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        self.api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| map_error(e, key))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>, StoreError> {
        let list = self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .map_err(StoreError::Kube)?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        self.api(&key.namespace)
            .create(&post_params(), obj)
            .await
            .map_err(|e| map_error(e, &key))
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        self.api(&key.namespace)
            .replace(&key.name, &post_params(), obj)
            .await
            .map_err(|e| map_error(e, &key))
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = ObjectKey::of(obj);
        let value = serde_json::to_value(obj)?;
        let status = value
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        // resourceVersion in a merge patch turns it into a conditional write
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });
        self.api(&key.namespace)
            .patch_status(&key.name, &patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(e, &key))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        match self
            .api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                debug!(resource = %key, "delete: already gone");
                Ok(())
            }
            Err(e) => Err(map_error(e, key)),
        }
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent<K>> {
        let api: Api<K> = Api::all(self.client.clone());
        watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj)) => {
                        Some(WatchEvent::Applied(obj))
                    }
                    Ok(watcher::Event::Delete(obj)) => Some(WatchEvent::Deleted(obj)),
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(e) => {
                        // The stream retries with backoff on its own
                        error!("Error watching {}: {}", std::any::type_name::<K>(), e);
                        None
                    }
                }
            })
            .boxed()
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(CONTROLLER_NAME.to_string()),
        ..PostParams::default()
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(CONTROLLER_NAME.to_string()),
        ..PatchParams::default()
    }
}
