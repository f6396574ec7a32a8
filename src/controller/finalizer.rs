//! # Finalizers
//!
//! Brokers, instances and bindings carry [`FINALIZER`] so broker-side cleanup runs
//! before the record leaves the store.

use crate::constants::FINALIZER;
use crate::store::{ObjectStore, StoreError, StoredResource};

#[must_use]
pub fn has_finalizer<K: StoredResource>(obj: &K) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == FINALIZER))
}

/// Add the finalizer if missing; returns the stored object
///
/// # Errors
///
/// Propagates store errors, including conflicts.
pub async fn ensure_finalizer<K: StoredResource>(
    store: &dyn ObjectStore<K>,
    obj: K,
) -> Result<K, StoreError> {
    if has_finalizer(&obj) {
        return Ok(obj);
    }
    let mut updated = obj;
    updated
        .meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER.to_string());
    store.update(&updated).await
}

/// Drop the finalizer so the store can remove a record marked for deletion
///
/// # Errors
///
/// Propagates store errors, including conflicts.
pub async fn remove_finalizer<K: StoredResource>(
    store: &dyn ObjectStore<K>,
    obj: &K,
) -> Result<(), StoreError> {
    if !has_finalizer(obj) {
        return Ok(());
    }
    let mut updated = obj.clone();
    if let Some(finalizers) = updated.meta_mut().finalizers.as_mut() {
        finalizers.retain(|name| name != FINALIZER);
    }
    match store.update(&updated).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{is_deleting, MemoryStore, ObjectKey};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn test_finalizer_holds_deletion_until_removed() {
        let store = MemoryStore::<ConfigMap>::new();
        let created = store.create(&config_map()).await.unwrap();
        let with_finalizer = ensure_finalizer(&store, created).await.unwrap();
        assert!(has_finalizer(&with_finalizer));

        let key = ObjectKey::new("default", "cm");
        store.delete(&key).await.unwrap();
        let deleting = store.get(&key).await.unwrap().unwrap();
        assert!(is_deleting(&deleting));

        remove_finalizer(&store, &deleting).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ensure_finalizer_is_idempotent() {
        let store = MemoryStore::<ConfigMap>::new();
        let created = store.create(&config_map()).await.unwrap();
        let once = ensure_finalizer(&store, created).await.unwrap();
        let twice = ensure_finalizer(&store, once.clone()).await.unwrap();
        assert_eq!(once.metadata.resource_version, twice.metadata.resource_version);
        assert_eq!(twice.metadata.finalizers.unwrap().len(), 1);
    }
}
