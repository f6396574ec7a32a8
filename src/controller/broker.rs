//! # Broker Reconciler
//!
//! Keeps a ServiceBroker's classes and plans in step with its catalog.
//!
//! A reconcile pass:
//! 1. handles deletion (client eviction, catalog entry cleanup, finalizer removal)
//! 2. ensures the finalizer
//! 3. decides whether a relist is due
//! 4. fetches the catalog and materializes it
//! 5. records the outcome in the Ready condition and schedules the next timed relist

use crate::broker::ClientError;
use crate::controller::catalog::{
    apply_catalog, catalog_filter, fetch_catalog, next_relist_delay, relist_trigger,
};
use crate::controller::class_plan::retire_entry;
use crate::controller::dispatcher::Reconcile;
use crate::controller::finalizer::{ensure_finalizer, remove_finalizer};
use crate::controller::status::{reason, ConditionedStatus};
use crate::controller::types::{Context, ReconcileAction, ReconcileError};
use crate::crd::{ServiceBroker, ServiceBrokerStatus};
use crate::observability::metrics;
use crate::store::{is_deleting, ObjectKey};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

pub const KIND: &str = "broker";

#[derive(Debug)]
pub struct BrokerReconciler {
    ctx: Arc<Context>,
}

impl BrokerReconciler {
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn reconcile_broker(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let Some(broker) = self.ctx.stores.brokers.get(key).await? else {
            self.ctx.clients.forget(key);
            return Ok(ReconcileAction::Done);
        };

        if is_deleting(&broker) {
            return self.finalize(key, &broker).await;
        }

        let broker = ensure_finalizer(self.ctx.stores.brokers.as_ref(), broker).await?;

        let now = chrono::Utc::now();
        let Some(trigger) = relist_trigger(&broker, now) else {
            debug!("catalog is current");
            return Ok(next_relist_delay(&broker, now, self.ctx.config.broker_resync_interval())
                .map_or(ReconcileAction::Done, ReconcileAction::RequeueAfter));
        };
        info!(trigger = trigger.as_str(), "relisting broker catalog");

        let filter = match catalog_filter(&broker) {
            Ok(filter) => filter,
            Err(e) => {
                // Malformed restrictions only change with a spec edit
                warn!("invalid catalog restrictions: {}", e);
                self.write_ready(&broker, false, reason::ERROR_SYNCING_CATALOG, &e.to_string())
                    .await?;
                return Ok(ReconcileAction::Done);
            }
        };

        let client = match self.ctx.clients.get_client(&broker).await {
            Ok(client) => client,
            Err(ClientError::Auth(e)) => {
                self.write_ready(
                    &broker,
                    false,
                    reason::ERROR_GETTING_AUTH_CREDENTIALS,
                    &e.to_string(),
                )
                .await?;
                return Err(e.into());
            }
            Err(e) => {
                self.write_ready(&broker, false, reason::ERROR_FETCHING_CATALOG, &e.to_string())
                    .await?;
                return Err(e.into());
            }
        };

        let catalog = match fetch_catalog(client.as_ref(), &broker).await {
            Ok(catalog) => catalog,
            Err(e) => {
                self.write_ready(&broker, false, reason::ERROR_FETCHING_CATALOG, &e.to_string())
                    .await?;
                return Err(e.into());
            }
        };

        let summary = match apply_catalog(&self.ctx.stores, &broker, &catalog, &filter).await {
            Ok(summary) => summary,
            Err(e) if e.is_conflict() => return Err(e.into()),
            Err(e) => {
                self.write_ready(&broker, false, reason::ERROR_SYNCING_CATALOG, &e.to_string())
                    .await?;
                return Err(e.into());
            }
        };
        metrics::increment_catalog_syncs(trigger.as_str());
        info!(
            classes = summary.classes,
            plans = summary.plans,
            removed_classes = summary.removed_classes,
            removed_plans = summary.removed_plans,
            "catalog synced"
        );

        let mut updated = broker.clone();
        let status = updated.status.get_or_insert_with(ServiceBrokerStatus::default);
        status.set_ready(true, reason::FETCHED_CATALOG, "Successfully fetched catalog entries from broker.");
        status.observed_generation = broker.metadata.generation;
        status.last_catalog_retrieval_time = Some(now.to_rfc3339());
        status.last_observed_relist_requests = Some(broker.spec.relist_requests);
        let updated = self.ctx.stores.brokers.update_status(&updated).await?;

        Ok(next_relist_delay(&updated, now, self.ctx.config.broker_resync_interval())
            .map_or(ReconcileAction::Done, ReconcileAction::RequeueAfter))
    }

    async fn finalize(
        &self,
        key: &ObjectKey,
        broker: &ServiceBroker,
    ) -> Result<ReconcileAction, ReconcileError> {
        self.ctx.clients.forget(key);

        let namespace = key.namespace.as_str();
        let broker_name = broker.name_any();
        let mut deleted = 0_usize;
        for plan in self.ctx.stores.plans.list(namespace).await? {
            if plan.spec.broker_name == broker_name && retire_entry(&self.ctx.stores, &plan).await? {
                deleted += 1;
            }
        }
        for class in self.ctx.stores.classes.list(namespace).await? {
            if class.spec.broker_name == broker_name && retire_entry(&self.ctx.stores, &class).await? {
                deleted += 1;
            }
        }
        info!(deleted_entries = deleted, "broker deleted, cleaned up catalog entries");

        remove_finalizer(self.ctx.stores.brokers.as_ref(), broker).await?;
        Ok(ReconcileAction::Done)
    }

    async fn write_ready(
        &self,
        broker: &ServiceBroker,
        ready: bool,
        reason: &str,
        message: &str,
    ) -> Result<(), ReconcileError> {
        let mut updated = broker.clone();
        updated
            .status
            .get_or_insert_with(ServiceBrokerStatus::default)
            .set_ready(ready, reason, message);
        self.ctx.stores.brokers.update_status(&updated).await?;
        Ok(())
    }
}

#[async_trait]
impl Reconcile for BrokerReconciler {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "controller.broker.reconcile",
            resource.kind = KIND,
            resource.namespace = %key.namespace,
            resource.name = %key.name
        );
        self.reconcile_broker(key).instrument(span).await
    }
}
