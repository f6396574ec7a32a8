//! # Catalog Entry Garbage Collection
//!
//! ServiceClass and ServicePlan records dropped from a broker's catalog are only
//! marked removed. Once no instance references them any more they are deleted here.
//! Instance deletions re-enqueue the records they referenced.

use crate::controller::dispatcher::Reconcile;
use crate::controller::types::{Context, ReconcileAction, ReconcileError};
use crate::crd::{ServiceClass, ServiceInstance, ServicePlan};
use crate::store::{ObjectKey, SharedStore, StoreError, StoredResource, Stores};
use async_trait::async_trait;
use kube::ResourceExt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info, Instrument};

/// Common view over classes and plans
pub trait CatalogEntry: StoredResource {
    /// Queue and metric label
    const KIND: &'static str;

    fn store(stores: &Stores) -> &SharedStore<Self>;

    fn is_removed_from_catalog(&self) -> bool;

    fn broker_name(&self) -> &str;

    /// Whether an instance resolved to this entry
    fn is_referenced_by(&self, instance: &ServiceInstance) -> bool;
}

impl CatalogEntry for ServiceClass {
    const KIND: &'static str = "class";

    fn store(stores: &Stores) -> &SharedStore<Self> {
        &stores.classes
    }

    fn is_removed_from_catalog(&self) -> bool {
        self.is_removed()
    }

    fn broker_name(&self) -> &str {
        &self.spec.broker_name
    }

    fn is_referenced_by(&self, instance: &ServiceInstance) -> bool {
        let name = self.name_any();
        instance
            .status
            .as_ref()
            .and_then(|s| s.service_class_ref.as_deref())
            == Some(name.as_str())
    }
}

impl CatalogEntry for ServicePlan {
    const KIND: &'static str = "plan";

    fn store(stores: &Stores) -> &SharedStore<Self> {
        &stores.plans
    }

    fn is_removed_from_catalog(&self) -> bool {
        self.is_removed()
    }

    fn broker_name(&self) -> &str {
        &self.spec.broker_name
    }

    fn is_referenced_by(&self, instance: &ServiceInstance) -> bool {
        let name = self.name_any();
        instance
            .status
            .as_ref()
            .and_then(|s| s.service_plan_ref.as_deref())
            == Some(name.as_str())
    }
}

/// Whether any instance in the entry's namespace references it
///
/// # Errors
///
/// Propagates store read errors.
pub async fn is_referenced<E: CatalogEntry>(stores: &Stores, entry: &E) -> Result<bool, StoreError> {
    let namespace = entry.namespace().unwrap_or_else(|| "default".to_string());
    let instances = stores.instances.list(&namespace).await?;
    Ok(instances.iter().any(|i| entry.is_referenced_by(i)))
}

/// Delete an entry unless an instance references it, in which case it is marked removed
///
/// Returns `true` when the entry was deleted.
///
/// # Errors
///
/// Propagates store errors.
pub async fn retire_entry<E: CatalogEntry>(stores: &Stores, entry: &E) -> Result<bool, StoreError>
where
    E: HasRemovedFlag,
{
    let key = ObjectKey::of(entry);
    if is_referenced(stores, entry).await? {
        if !entry.is_removed_from_catalog() {
            let mut removed = entry.clone();
            removed.mark_removed();
            E::store(stores).update_status(&removed).await?;
        }
        debug!(resource.kind = E::KIND, resource.key = %key, "entry still referenced, kept as removed");
        return Ok(false);
    }
    E::store(stores).delete(&key).await?;
    info!(resource.kind = E::KIND, resource.key = %key, "deleted catalog entry");
    Ok(true)
}

/// Entries whose removed-from-catalog flag can be set
pub trait HasRemovedFlag {
    fn mark_removed(&mut self);
}

impl HasRemovedFlag for ServiceClass {
    fn mark_removed(&mut self) {
        self.status.get_or_insert_with(Default::default).removed_from_broker_catalog = true;
    }
}

impl HasRemovedFlag for ServicePlan {
    fn mark_removed(&mut self) {
        self.status.get_or_insert_with(Default::default).removed_from_broker_catalog = true;
    }
}

/// Deletes removed, unreferenced classes or plans
pub struct CatalogEntryReconciler<E> {
    ctx: Arc<Context>,
    _kind: PhantomData<fn() -> E>,
}

impl<E> std::fmt::Debug for CatalogEntryReconciler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogEntryReconciler").finish_non_exhaustive()
    }
}

impl<E: CatalogEntry + HasRemovedFlag> CatalogEntryReconciler<E> {
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            _kind: PhantomData,
        }
    }

    async fn collect(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let Some(entry) = E::store(&self.ctx.stores).get(key).await? else {
            return Ok(ReconcileAction::Done);
        };
        if !entry.is_removed_from_catalog() {
            return Ok(ReconcileAction::Done);
        }
        if is_referenced(&self.ctx.stores, &entry).await? {
            debug!(broker.name = entry.broker_name(), "removed entry still referenced");
            return Ok(ReconcileAction::Done);
        }
        E::store(&self.ctx.stores).delete(key).await?;
        info!(broker.name = entry.broker_name(), "deleted catalog entry no longer offered by its broker");
        Ok(ReconcileAction::Done)
    }
}

#[async_trait]
impl<E: CatalogEntry + HasRemovedFlag> Reconcile for CatalogEntryReconciler<E> {
    fn kind(&self) -> &'static str {
        E::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "controller.catalog_entry.reconcile",
            resource.kind = E::KIND,
            resource.namespace = %key.namespace,
            resource.name = %key.name
        );
        self.collect(key).instrument(span).await
    }
}
