//! # Instance Reconciler
//!
//! Drives a ServiceInstance through provision, update and deprovision.
//!
//! Every broker call is keyed by the instance's `spec.externalID`, assigned once
//! together with the finalizer before the first call. Before a create-type call
//! goes out, `deprovisionStatus` is set to `Required` so a crash between the call
//! and the status write never leaks a broker-side instance.
//!
//! ## Sub-states
//!
//! - `asyncOpInProgress`: an operation is polled with per-key backoff until it resolves
//! - `orphanMitigationInProgress`: a corrective deprovision after an ambiguous provision
//!
//! A deletion requested while either sub-state is active waits for it to resolve and
//! then deprovisions.

use crate::broker::{
    BrokerClient, BrokerError, CallKind, ClientError, DeprovisionRequest, DeprovisionResponse,
    LastOperationRequest, LastOperationResponse, LastOperationState, Outcome, Parameters,
    ProvisionRequest, ProvisionResponse, UpdateRequest, UpdateResponse,
};
use crate::constants::FINALIZER;
use crate::controller::dispatcher::Reconcile;
use crate::controller::finalizer::{has_finalizer, remove_finalizer};
use crate::controller::parameters::{resolve_parameters, ResolvedParameters};
use crate::controller::status::{
    find_condition, now, reason, ConditionedStatus, CONDITION_READY,
};
use crate::controller::types::{Context, ReconcileAction, ReconcileError};
use crate::crd::{
    DeprovisionStatus, InstanceOperation, InstanceProperties, ServiceClass, ServiceInstance,
    ServiceInstanceSpec, ServiceInstanceStatus, ServicePlan,
};
use crate::observability::metrics;
use crate::store::{is_deleting, ObjectKey};
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

pub const KIND: &str = "instance";

/// Where broker calls for an instance go
struct Target {
    client: Arc<dyn BrokerClient>,
    service_id: String,
    plan_id: String,
}

enum PollResult {
    InProgress,
    Resolved,
}

fn status_mut(instance: &mut ServiceInstance) -> &mut ServiceInstanceStatus {
    instance
        .status
        .get_or_insert_with(ServiceInstanceStatus::default)
}

fn external_id(instance: &ServiceInstance) -> String {
    instance.spec.external_id.clone().unwrap_or_default()
}

fn namespace_of(instance: &ServiceInstance) -> String {
    instance.namespace().unwrap_or_else(|| "default".to_string())
}

/// Acted on the current generation and reached Ready or a terminal failure
fn is_settled(instance: &ServiceInstance) -> bool {
    let Some(status) = instance.status.as_ref() else {
        return false;
    };
    status.observed_generation.is_some()
        && status.observed_generation == instance.metadata.generation
        && (status.is_ready() || status.is_failed())
}

fn clear_operation(status: &mut ServiceInstanceStatus) {
    status.async_op_in_progress = false;
    status.last_operation = None;
    status.current_operation = None;
    status.operation_start_time = None;
    status.in_progress_properties = None;
    status.operation_generation = None;
}

fn start_operation(
    status: &mut ServiceInstanceStatus,
    operation: InstanceOperation,
    generation: Option<i64>,
) {
    status.current_operation = Some(operation);
    status.operation_start_time = Some(now());
    status.operation_generation = generation;
}

fn finish_provision(status: &mut ServiceInstanceStatus) {
    status.provisioned = true;
    status.external_properties = status.in_progress_properties.take();
    status.observed_generation = status
        .operation_generation
        .take()
        .or(status.observed_generation);
    clear_operation(status);
    status.clear_failed();
    status.set_ready(
        true,
        reason::PROVISIONED_SUCCESSFULLY,
        "The instance was provisioned successfully",
    );
}

fn finish_update(status: &mut ServiceInstanceStatus) {
    status.external_properties = status.in_progress_properties.take();
    status.observed_generation = status
        .operation_generation
        .take()
        .or(status.observed_generation);
    clear_operation(status);
    status.clear_failed();
    status.set_ready(
        true,
        reason::INSTANCE_UPDATED_SUCCESSFULLY,
        "The instance was updated successfully",
    );
}

/// Terminal failure of the operation in flight; the generation that started it
/// counts as observed
fn fail_operation(status: &mut ServiceInstanceStatus, reason: &str, message: &str) {
    let generation = status.operation_generation.or(status.observed_generation);
    clear_operation(status);
    status.observed_generation = generation;
    status.set_failed(reason, message);
}

fn user_specified_class(spec: &ServiceInstanceSpec) -> String {
    spec.service_class_external_name
        .as_deref()
        .or(spec.service_class_name.as_deref())
        .unwrap_or_default()
        .to_string()
}

fn user_specified_plan(spec: &ServiceInstanceSpec) -> String {
    spec.service_plan_external_name
        .as_deref()
        .or(spec.service_plan_name.as_deref())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug)]
pub struct InstanceReconciler {
    ctx: Arc<Context>,
}

impl InstanceReconciler {
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn reconcile_instance(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let Some(instance) = self.ctx.stores.instances.get(key).await? else {
            self.ctx.reset_poll(KIND, key);
            return Ok(ReconcileAction::Done);
        };

        if is_deleting(&instance) {
            return self.reconcile_delete(instance).await;
        }

        let mut instance = self.prepare(instance).await?;
        let current = instance.status.clone().unwrap_or_default();

        if current.async_op_in_progress {
            let Some(target) = self.target_from_status(&mut instance).await? else {
                return Ok(ReconcileAction::Retry);
            };
            return match self.poll(&mut instance, &target).await? {
                PollResult::InProgress => Ok(self.poll_later(key)),
                PollResult::Resolved => Ok(self.after_resolution(&instance)),
            };
        }

        if current.orphan_mitigation_in_progress {
            let Some(target) = self.target_from_status(&mut instance).await? else {
                return Ok(ReconcileAction::Retry);
            };
            return Ok(self
                .mitigate_orphan(&mut instance, &target)
                .await?
                .unwrap_or(ReconcileAction::Retry));
        }

        if is_settled(&instance) {
            debug!("instance is up to date");
            return Ok(ReconcileAction::Done);
        }

        let Some((class, plan)) = self.resolve_catalog(&mut instance).await? else {
            return Ok(ReconcileAction::Retry);
        };
        let Some(client) = self
            .client_for(&mut instance, &class.spec.broker_name)
            .await?
        else {
            return Ok(ReconcileAction::Retry);
        };

        let namespace = namespace_of(&instance);
        let resolved = match resolve_parameters(
            self.ctx.stores.secrets.as_ref(),
            &namespace,
            instance.spec.parameters.as_ref(),
            &instance.spec.parameters_from,
        )
        .await
        {
            Ok(resolved) => resolved,
            Err(e) if e.is_terminal() => {
                warn!("failed to prepare parameters: {}", e);
                let generation = instance.metadata.generation;
                let status = status_mut(&mut instance);
                status.set_failed(
                    reason::ERROR_WITH_PARAMETERS,
                    &format!("Failed to prepare ServiceInstance parameters: {e}"),
                );
                status.observed_generation = generation;
                self.save(&mut instance).await?;
                return Ok(ReconcileAction::Done);
            }
            Err(e) => return Err(ReconcileError::Transient(e.to_string())),
        };

        let target = Target {
            client,
            service_id: class.spec.external_id.clone(),
            plan_id: plan.spec.external_id.clone(),
        };

        if !current.provisioned {
            return self.provision(&mut instance, &plan, &target, resolved).await;
        }

        let acknowledged = current.external_properties.clone().unwrap_or_default();
        if acknowledged.service_plan_external_id != target.plan_id
            || acknowledged.parameters_checksum != resolved.checksum
        {
            return self
                .update(&mut instance, &acknowledged, &target, resolved)
                .await;
        }

        // The spec changed without anything the broker needs to know about
        let generation = instance.metadata.generation;
        let status = status_mut(&mut instance);
        status.observed_generation = generation;
        status.clear_failed();
        if !status.is_ready() {
            status.set_ready(
                true,
                reason::PROVISIONED_SUCCESSFULLY,
                "The instance was provisioned successfully",
            );
        }
        self.save(&mut instance).await?;
        Ok(ReconcileAction::Done)
    }

    /// Assign the external ID and finalizer in one write
    async fn prepare(&self, instance: ServiceInstance) -> Result<ServiceInstance, ReconcileError> {
        if has_finalizer(&instance) && instance.spec.external_id.is_some() {
            return Ok(instance);
        }
        let mut updated = instance;
        if updated.spec.external_id.is_none() {
            let id = uuid::Uuid::new_v4().to_string();
            debug!(external_id = %id, "assigned external ID");
            updated.spec.external_id = Some(id);
        }
        if !has_finalizer(&updated) {
            updated
                .meta_mut()
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(FINALIZER.to_string());
        }
        Ok(self.ctx.stores.instances.update(&updated).await?)
    }

    fn poll_later(&self, key: &ObjectKey) -> ReconcileAction {
        ReconcileAction::RequeueAfter(self.ctx.next_poll_delay(KIND, key))
    }

    /// Retry unless the resolved operation settled the instance
    fn after_resolution(&self, instance: &ServiceInstance) -> ReconcileAction {
        self.ctx.reset_poll(KIND, &ObjectKey::of(instance));
        if is_settled(instance) {
            ReconcileAction::Done
        } else {
            ReconcileAction::Retry
        }
    }

    async fn save(&self, instance: &mut ServiceInstance) -> Result<(), ReconcileError> {
        *instance = self.ctx.stores.instances.update_status(instance).await?;
        Ok(())
    }

    async fn set_not_ready(
        &self,
        instance: &mut ServiceInstance,
        reason: &str,
        message: &str,
    ) -> Result<(), ReconcileError> {
        status_mut(instance).set_ready(false, reason, message);
        self.save(instance).await
    }

    // ========================================================================
    // References
    // ========================================================================

    async fn find_class(
        &self,
        namespace: &str,
        spec: &ServiceInstanceSpec,
    ) -> Result<Option<ServiceClass>, ReconcileError> {
        if let Some(name) = spec.service_class_name.as_deref() {
            return Ok(self
                .ctx
                .stores
                .classes
                .get(&ObjectKey::new(namespace, name))
                .await?);
        }
        let Some(external_name) = spec.service_class_external_name.as_deref() else {
            return Ok(None);
        };
        let candidates: Vec<ServiceClass> = self
            .ctx
            .stores
            .classes
            .list(namespace)
            .await?
            .into_iter()
            .filter(|c| c.spec.external_name == external_name)
            .collect();
        Ok(candidates
            .iter()
            .find(|c| !c.is_removed())
            .or_else(|| candidates.first())
            .cloned())
    }

    async fn find_plan(
        &self,
        namespace: &str,
        spec: &ServiceInstanceSpec,
        class: &ServiceClass,
    ) -> Result<Option<ServicePlan>, ReconcileError> {
        if let Some(name) = spec.service_plan_name.as_deref() {
            return Ok(self
                .ctx
                .stores
                .plans
                .get(&ObjectKey::new(namespace, name))
                .await?);
        }
        let Some(external_name) = spec.service_plan_external_name.as_deref() else {
            return Ok(None);
        };
        let class_name = class.name_any();
        let candidates: Vec<ServicePlan> = self
            .ctx
            .stores
            .plans
            .list(namespace)
            .await?
            .into_iter()
            .filter(|p| p.spec.service_class_ref == class_name && p.spec.external_name == external_name)
            .collect();
        Ok(candidates
            .iter()
            .find(|p| !p.is_removed())
            .or_else(|| candidates.first())
            .cloned())
    }

    /// Resolve the class and plan named by the spec and record them in the status
    async fn resolve_catalog(
        &self,
        instance: &mut ServiceInstance,
    ) -> Result<Option<(ServiceClass, ServicePlan)>, ReconcileError> {
        let namespace = namespace_of(instance);
        let spec = instance.spec.clone();

        let Some(class) = self.find_class(&namespace, &spec).await? else {
            let message = format!(
                "The instance references a non-existent ServiceClass {:?}",
                user_specified_class(&spec)
            );
            warn!("{}", message);
            self.set_not_ready(instance, reason::REFERENCES_NONEXISTENT_SERVICE_CLASS, &message)
                .await?;
            return Ok(None);
        };
        let Some(plan) = self.find_plan(&namespace, &spec, &class).await? else {
            let message = format!(
                "The instance references a non-existent ServicePlan {:?} of ServiceClass {:?}",
                user_specified_plan(&spec),
                class.spec.external_name
            );
            warn!("{}", message);
            self.set_not_ready(instance, reason::REFERENCES_NONEXISTENT_SERVICE_PLAN, &message)
                .await?;
            return Ok(None);
        };

        let status = status_mut(instance);
        status.service_class_ref = Some(class.name_any());
        status.service_plan_ref = Some(plan.name_any());
        status.user_specified_class_name =
            Some(format!("ServiceClass/{}", user_specified_class(&spec)));
        status.user_specified_plan_name =
            Some(format!("ServicePlan/{}", user_specified_plan(&spec)));
        Ok(Some((class, plan)))
    }

    async fn client_for(
        &self,
        instance: &mut ServiceInstance,
        broker_name: &str,
    ) -> Result<Option<Arc<dyn BrokerClient>>, ReconcileError> {
        let key = ObjectKey::new(namespace_of(instance), broker_name);
        let Some(broker) = self.ctx.stores.brokers.get(&key).await? else {
            let message = format!("The instance references a non-existent broker {broker_name:?}");
            self.set_not_ready(instance, reason::REFERENCES_NONEXISTENT_BROKER, &message)
                .await?;
            return Ok(None);
        };
        match self.ctx.clients.get_client(&broker).await {
            Ok(client) => Ok(Some(client)),
            Err(ClientError::Auth(e)) => {
                let message =
                    format!("Error getting broker auth credentials for broker {broker_name:?}: {e}");
                self.set_not_ready(instance, reason::ERROR_GETTING_AUTH_CREDENTIALS, &message)
                    .await?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Broker target from the references recorded by an earlier pass
    async fn target_from_status(
        &self,
        instance: &mut ServiceInstance,
    ) -> Result<Option<Target>, ReconcileError> {
        let namespace = namespace_of(instance);
        let current = instance.status.clone().unwrap_or_default();

        let class = match current.service_class_ref.as_deref() {
            Some(name) => {
                self.ctx
                    .stores
                    .classes
                    .get(&ObjectKey::new(&namespace, name))
                    .await?
            }
            None => None,
        };
        let Some(class) = class else {
            let message = format!(
                "The instance references a non-existent ServiceClass {:?}",
                current.service_class_ref.unwrap_or_default()
            );
            self.set_not_ready(instance, reason::REFERENCES_NONEXISTENT_SERVICE_CLASS, &message)
                .await?;
            return Ok(None);
        };

        let recorded_plan_id = current
            .in_progress_properties
            .as_ref()
            .or(current.external_properties.as_ref())
            .map(|p| p.service_plan_external_id.clone())
            .filter(|id| !id.is_empty());
        let plan_id = match recorded_plan_id {
            Some(id) => id,
            None => {
                let plan = match current.service_plan_ref.as_deref() {
                    Some(name) => {
                        self.ctx
                            .stores
                            .plans
                            .get(&ObjectKey::new(&namespace, name))
                            .await?
                    }
                    None => None,
                };
                let Some(plan) = plan else {
                    let message = format!(
                        "The instance references a non-existent ServicePlan {:?}",
                        current.service_plan_ref.unwrap_or_default()
                    );
                    self.set_not_ready(instance, reason::REFERENCES_NONEXISTENT_SERVICE_PLAN, &message)
                        .await?;
                    return Ok(None);
                };
                plan.spec.external_id
            }
        };

        let Some(client) = self.client_for(instance, &class.spec.broker_name).await? else {
            return Ok(None);
        };
        Ok(Some(Target {
            client,
            service_id: class.spec.external_id,
            plan_id,
        }))
    }

    // ========================================================================
    // Provision
    // ========================================================================

    async fn provision(
        &self,
        instance: &mut ServiceInstance,
        plan: &ServicePlan,
        target: &Target,
        resolved: ResolvedParameters,
    ) -> Result<ReconcileAction, ReconcileError> {
        let generation = instance.metadata.generation;
        if plan.is_removed() {
            let message = format!(
                "The ServicePlan {:?} has been removed from the broker's catalog and cannot be used to provision new instances",
                plan.spec.external_name
            );
            warn!("{}", message);
            let status = status_mut(instance);
            status.set_failed(reason::ERROR_DELETED_SERVICE_PLAN, &message);
            status.observed_generation = generation;
            self.save(instance).await?;
            return Ok(ReconcileAction::Done);
        }

        let status = status_mut(instance);
        start_operation(status, InstanceOperation::Provision, generation);
        status.in_progress_properties = Some(InstanceProperties {
            service_plan_external_id: target.plan_id.clone(),
            parameters_checksum: resolved.checksum.clone(),
        });
        status.deprovision_status = DeprovisionStatus::Required;
        status.set_ready(
            false,
            reason::PROVISIONING,
            "Provision request for the instance is in flight to the broker",
        );
        self.save(instance).await?;

        let namespace = namespace_of(instance);
        let request = ProvisionRequest {
            instance_id: external_id(instance),
            service_id: target.service_id.clone(),
            plan_id: target.plan_id.clone(),
            organization_guid: self.ctx.config.cluster_id.clone(),
            space_guid: namespace.clone(),
            parameters: resolved.parameters,
            context: self.ctx.request_context(&namespace, &instance.name_any()),
            originating_identity: self.ctx.originating_identity(instance.spec.user_info.as_ref()),
        };
        info!(plan = %target.plan_id, "provisioning instance");

        match target.client.provision_instance(&request).await {
            Ok(ProvisionResponse::Completed { dashboard_url }) => {
                let status = status_mut(instance);
                if dashboard_url.is_some() {
                    status.dashboard_url = dashboard_url;
                }
                finish_provision(status);
                self.save(instance).await?;
                info!("instance provisioned");
                Ok(ReconcileAction::Done)
            }
            Ok(ProvisionResponse::InProgress {
                dashboard_url,
                operation,
            }) => {
                let status = status_mut(instance);
                if dashboard_url.is_some() {
                    status.dashboard_url = dashboard_url;
                }
                status.async_op_in_progress = true;
                status.last_operation = operation;
                status.set_ready(
                    false,
                    reason::PROVISIONING,
                    "The instance is being provisioned asynchronously",
                );
                self.save(instance).await?;
                info!("asynchronous provision started");
                Ok(self.poll_later(&ObjectKey::of(instance)))
            }
            Err(e) => self.provision_failed(instance, target, e).await,
        }
    }

    async fn provision_failed(
        &self,
        instance: &mut ServiceInstance,
        target: &Target,
        error: BrokerError,
    ) -> Result<ReconcileAction, ReconcileError> {
        let message = format!("Error provisioning the instance: {error}");
        match error.classify(CallKind::Provision) {
            Outcome::Transient => {
                warn!("{}", message);
                let status = status_mut(instance);
                clear_operation(status);
                status.set_ready(false, reason::PROVISION_CALL_FAILED, &message);
                self.save(instance).await?;
                Err(error.into())
            }
            Outcome::Rejected => {
                warn!("provision rejected by the broker: {}", error);
                let status = status_mut(instance);
                status.deprovision_status = DeprovisionStatus::NotRequired;
                fail_operation(status, reason::PROVISION_CALL_FAILED, &message);
                self.save(instance).await?;
                Ok(ReconcileAction::Done)
            }
            Outcome::Ambiguous => {
                warn!("provision outcome unknown, starting orphan mitigation: {}", error);
                metrics::increment_orphan_mitigations(KIND);
                let status = status_mut(instance);
                clear_operation(status);
                status.orphan_mitigation_in_progress = true;
                status.set_ready(
                    false,
                    reason::STARTING_ORPHAN_MITIGATION,
                    &format!(
                        "The provision call failed with an ambiguous error; deprovisioning to avoid an orphaned instance: {error}"
                    ),
                );
                self.save(instance).await?;
                Ok(self
                    .mitigate_orphan(instance, target)
                    .await?
                    .unwrap_or(ReconcileAction::Retry))
            }
        }
    }

    /// Deprovision after an ambiguous provision
    ///
    /// Returns `None` once the broker confirmed the instance is gone.
    async fn mitigate_orphan(
        &self,
        instance: &mut ServiceInstance,
        target: &Target,
    ) -> Result<Option<ReconcileAction>, ReconcileError> {
        let request = DeprovisionRequest {
            instance_id: external_id(instance),
            service_id: target.service_id.clone(),
            plan_id: target.plan_id.clone(),
            originating_identity: self.ctx.originating_identity(instance.spec.user_info.as_ref()),
        };
        match target.client.deprovision_instance(&request).await {
            Ok(DeprovisionResponse::Completed) => {
                self.orphan_mitigated(instance).await?;
                Ok(None)
            }
            Ok(DeprovisionResponse::InProgress { operation }) => {
                let generation = instance.metadata.generation;
                let status = status_mut(instance);
                start_operation(status, InstanceOperation::Deprovision, generation);
                status.async_op_in_progress = true;
                status.last_operation = operation;
                status.deprovision_status = DeprovisionStatus::InProgress;
                status.set_ready(
                    false,
                    reason::STARTING_ORPHAN_MITIGATION,
                    "Orphan mitigation is deprovisioning the instance asynchronously",
                );
                self.save(instance).await?;
                Ok(Some(self.poll_later(&ObjectKey::of(instance))))
            }
            Err(e) if e.is_gone() => {
                self.orphan_mitigated(instance).await?;
                Ok(None)
            }
            Err(e) => {
                warn!("orphan mitigation failed: {}", e);
                self.set_not_ready(
                    instance,
                    reason::ORPHAN_MITIGATION_FAILED,
                    &format!("Orphan mitigation failed: {e}"),
                )
                .await?;
                Err(e.into())
            }
        }
    }

    async fn orphan_mitigated(&self, instance: &mut ServiceInstance) -> Result<(), ReconcileError> {
        let status = status_mut(instance);
        clear_operation(status);
        status.orphan_mitigation_in_progress = false;
        status.provisioned = false;
        status.deprovision_status = DeprovisionStatus::NotRequired;
        status.set_ready(
            false,
            reason::ORPHAN_MITIGATION_SUCCESSFUL,
            "Orphan mitigation was completed successfully",
        );
        self.save(instance).await?;
        self.ctx.reset_poll(KIND, &ObjectKey::of(instance));
        info!("orphan mitigation completed");
        Ok(())
    }

    // ========================================================================
    // Update
    // ========================================================================

    async fn update(
        &self,
        instance: &mut ServiceInstance,
        acknowledged: &InstanceProperties,
        target: &Target,
        resolved: ResolvedParameters,
    ) -> Result<ReconcileAction, ReconcileError> {
        let plan_changed = acknowledged.service_plan_external_id != target.plan_id;
        let parameters_changed = acknowledged.parameters_checksum != resolved.checksum;

        let generation = instance.metadata.generation;
        let status = status_mut(instance);
        start_operation(status, InstanceOperation::Update, generation);
        status.in_progress_properties = Some(InstanceProperties {
            service_plan_external_id: target.plan_id.clone(),
            parameters_checksum: resolved.checksum.clone(),
        });
        status.set_ready(
            false,
            reason::UPDATING_INSTANCE,
            "Update request for the instance is in flight to the broker",
        );
        self.save(instance).await?;

        let namespace = namespace_of(instance);
        let request = UpdateRequest {
            instance_id: external_id(instance),
            service_id: target.service_id.clone(),
            plan_id: plan_changed.then(|| target.plan_id.clone()),
            previous_plan_id: Some(acknowledged.service_plan_external_id.clone())
                .filter(|id| !id.is_empty()),
            parameters: if parameters_changed {
                Some(resolved.parameters.unwrap_or_else(Parameters::new))
            } else {
                None
            },
            context: self.ctx.request_context(&namespace, &instance.name_any()),
            originating_identity: self.ctx.originating_identity(instance.spec.user_info.as_ref()),
        };
        info!(plan_changed, parameters_changed, "updating instance");

        match target.client.update_instance(&request).await {
            Ok(UpdateResponse::Completed { dashboard_url }) => {
                let status = status_mut(instance);
                if dashboard_url.is_some() {
                    status.dashboard_url = dashboard_url;
                }
                finish_update(status);
                self.save(instance).await?;
                info!("instance updated");
                Ok(ReconcileAction::Done)
            }
            Ok(UpdateResponse::InProgress { operation }) => {
                let status = status_mut(instance);
                status.async_op_in_progress = true;
                status.last_operation = operation;
                status.set_ready(
                    false,
                    reason::UPDATING_INSTANCE,
                    "The instance is being updated asynchronously",
                );
                self.save(instance).await?;
                Ok(self.poll_later(&ObjectKey::of(instance)))
            }
            Err(e) => {
                let message = format!("Error updating the instance: {e}");
                if e.classify(CallKind::Update) == Outcome::Rejected {
                    warn!("update rejected by the broker: {}", e);
                    fail_operation(status_mut(instance), reason::UPDATE_INSTANCE_CALL_FAILED, &message);
                    self.save(instance).await?;
                    return Ok(ReconcileAction::Done);
                }
                let status = status_mut(instance);
                clear_operation(status);
                status.set_ready(false, reason::UPDATE_INSTANCE_CALL_FAILED, &message);
                self.save(instance).await?;
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Poll
    // ========================================================================

    async fn poll(
        &self,
        instance: &mut ServiceInstance,
        target: &Target,
    ) -> Result<PollResult, ReconcileError> {
        let current = instance.status.clone().unwrap_or_default();
        let operation = current
            .current_operation
            .unwrap_or(InstanceOperation::Provision);
        let request = LastOperationRequest {
            instance_id: external_id(instance),
            service_id: Some(target.service_id.clone()),
            plan_id: Some(target.plan_id.clone()),
            operation: current.last_operation.clone(),
            originating_identity: self.ctx.originating_identity(instance.spec.user_info.as_ref()),
        };

        let response = match target.client.poll_last_operation(&request).await {
            Ok(response) => response,
            Err(e) if e.is_gone() && operation == InstanceOperation::Deprovision => {
                LastOperationResponse {
                    state: LastOperationState::Succeeded,
                    description: None,
                }
            }
            Err(e) => {
                self.set_not_ready(
                    instance,
                    reason::ERROR_POLLING_LAST_OPERATION,
                    &format!("Error polling last operation: {e}"),
                )
                .await?;
                return Err(e.into());
            }
        };
        let description = response.description.unwrap_or_default();
        debug!(operation = ?operation, state = ?response.state, "polled last operation");

        match (response.state, operation) {
            (LastOperationState::InProgress, _) => {
                let (reason, message) = match operation {
                    InstanceOperation::Provision => {
                        (reason::PROVISIONING, "The instance is being provisioned asynchronously")
                    }
                    InstanceOperation::Update => {
                        (reason::UPDATING_INSTANCE, "The instance is being updated asynchronously")
                    }
                    InstanceOperation::Deprovision => {
                        (reason::DEPROVISIONING, "The instance is being deprovisioned asynchronously")
                    }
                };
                let message = if description.is_empty() {
                    message.to_string()
                } else {
                    format!("{message} ({description})")
                };
                let status = status_mut(instance);
                let unchanged = find_condition(&status.conditions, CONDITION_READY)
                    .is_some_and(|c| c.message.as_deref() == Some(message.as_str()));
                if !unchanged {
                    status.set_ready(false, reason, &message);
                    self.save(instance).await?;
                }
                return Ok(PollResult::InProgress);
            }
            (LastOperationState::Succeeded, InstanceOperation::Provision) => {
                finish_provision(status_mut(instance));
                self.save(instance).await?;
                info!("asynchronous provision succeeded");
            }
            (LastOperationState::Succeeded, InstanceOperation::Update) => {
                finish_update(status_mut(instance));
                self.save(instance).await?;
                info!("asynchronous update succeeded");
            }
            (LastOperationState::Succeeded, InstanceOperation::Deprovision) => {
                if current.orphan_mitigation_in_progress {
                    self.orphan_mitigated(instance).await?;
                } else {
                    self.mark_deprovisioned(instance).await?;
                }
            }
            (LastOperationState::Failed, InstanceOperation::Provision) => {
                warn!("asynchronous provision failed: {}", description);
                fail_operation(
                    status_mut(instance),
                    reason::PROVISION_CALL_FAILED,
                    &format!("Asynchronous provision failed: {description}"),
                );
                self.save(instance).await?;
            }
            (LastOperationState::Failed, InstanceOperation::Update) => {
                warn!("asynchronous update failed: {}", description);
                fail_operation(
                    status_mut(instance),
                    reason::UPDATE_INSTANCE_CALL_FAILED,
                    &format!("Asynchronous update failed: {description}"),
                );
                self.save(instance).await?;
            }
            (LastOperationState::Failed, InstanceOperation::Deprovision) => {
                let message = format!("Asynchronous deprovision failed: {description}");
                warn!("{}", message);
                let status = status_mut(instance);
                clear_operation(status);
                status.deprovision_status = DeprovisionStatus::Required;
                status.set_ready(false, reason::DEPROVISION_CALL_FAILED, &message);
                self.save(instance).await?;
                self.ctx.reset_poll(KIND, &ObjectKey::of(instance));
                return Err(ReconcileError::Transient(message));
            }
        }
        Ok(PollResult::Resolved)
    }

    // ========================================================================
    // Delete
    // ========================================================================

    async fn reconcile_delete(
        &self,
        instance: ServiceInstance,
    ) -> Result<ReconcileAction, ReconcileError> {
        if !has_finalizer(&instance) {
            return Ok(ReconcileAction::Done);
        }
        let key = ObjectKey::of(&instance);
        let mut instance = instance;

        let in_flight = instance
            .status
            .as_ref()
            .is_some_and(|s| s.async_op_in_progress);
        if in_flight {
            let Some(target) = self.target_from_status(&mut instance).await? else {
                return Ok(ReconcileAction::Retry);
            };
            if let PollResult::InProgress = self.poll(&mut instance, &target).await? {
                return Ok(self.poll_later(&key));
            }
        }

        let mitigating = instance
            .status
            .as_ref()
            .is_some_and(|s| s.orphan_mitigation_in_progress);
        if mitigating {
            let Some(target) = self.target_from_status(&mut instance).await? else {
                return Ok(ReconcileAction::Retry);
            };
            if let Some(action) = self.mitigate_orphan(&mut instance, &target).await? {
                return Ok(action);
            }
        }

        let name = instance.name_any();
        let bindings = self
            .ctx
            .stores
            .bindings
            .list(&key.namespace)
            .await?
            .into_iter()
            .filter(|b| b.spec.instance_ref.name == name)
            .count();
        if bindings > 0 {
            info!(bindings, "deprovision blocked by existing bindings");
            let blocked = instance.status.as_ref().and_then(|s| s.ready_reason())
                == Some(reason::DEPROVISION_BLOCKED_BY_EXISTING_CREDENTIALS);
            if !blocked {
                self.set_not_ready(
                    &mut instance,
                    reason::DEPROVISION_BLOCKED_BY_EXISTING_CREDENTIALS,
                    "All associated ServiceBindings must be removed before this ServiceInstance can be deleted",
                )
                .await?;
            }
            return Ok(ReconcileAction::Retry);
        }

        let deprovision_status = instance
            .status
            .as_ref()
            .map(|s| s.deprovision_status)
            .unwrap_or_default();
        match deprovision_status {
            DeprovisionStatus::NotRequired | DeprovisionStatus::Succeeded => {
                self.release(&instance).await?;
                Ok(ReconcileAction::Done)
            }
            DeprovisionStatus::Failed => {
                debug!("deprovision failed permanently, keeping finalizer");
                Ok(ReconcileAction::Done)
            }
            DeprovisionStatus::Required | DeprovisionStatus::InProgress => {
                self.deprovision(&mut instance).await
            }
        }
    }

    async fn deprovision(
        &self,
        instance: &mut ServiceInstance,
    ) -> Result<ReconcileAction, ReconcileError> {
        let Some(target) = self.target_from_status(instance).await? else {
            return Ok(ReconcileAction::Retry);
        };

        let generation = instance.metadata.generation;
        let status = status_mut(instance);
        start_operation(status, InstanceOperation::Deprovision, generation);
        status.set_ready(
            false,
            reason::DEPROVISIONING,
            "Deprovision request for the instance is in flight to the broker",
        );
        self.save(instance).await?;

        let request = DeprovisionRequest {
            instance_id: external_id(instance),
            service_id: target.service_id.clone(),
            plan_id: target.plan_id.clone(),
            originating_identity: self.ctx.originating_identity(instance.spec.user_info.as_ref()),
        };
        info!("deprovisioning instance");

        match target.client.deprovision_instance(&request).await {
            Ok(DeprovisionResponse::Completed) => {
                self.mark_deprovisioned(instance).await?;
                self.release(instance).await?;
                Ok(ReconcileAction::Done)
            }
            Ok(DeprovisionResponse::InProgress { operation }) => {
                let status = status_mut(instance);
                status.async_op_in_progress = true;
                status.last_operation = operation;
                status.deprovision_status = DeprovisionStatus::InProgress;
                status.set_ready(
                    false,
                    reason::DEPROVISIONING,
                    "The instance is being deprovisioned asynchronously",
                );
                self.save(instance).await?;
                Ok(self.poll_later(&ObjectKey::of(instance)))
            }
            Err(e) if e.is_gone() => {
                self.mark_deprovisioned(instance).await?;
                self.release(instance).await?;
                Ok(ReconcileAction::Done)
            }
            Err(e) => {
                let message = format!("Error deprovisioning the instance: {e}");
                if e.classify(CallKind::Deprovision) == Outcome::Rejected {
                    warn!("deprovision rejected by the broker: {}", e);
                    let status = status_mut(instance);
                    clear_operation(status);
                    status.deprovision_status = DeprovisionStatus::Failed;
                    status.set_failed(reason::DEPROVISION_CALL_FAILED, &message);
                    self.save(instance).await?;
                    return Ok(ReconcileAction::Done);
                }
                let status = status_mut(instance);
                clear_operation(status);
                status.set_ready(false, reason::DEPROVISION_CALL_FAILED, &message);
                self.save(instance).await?;
                Err(e.into())
            }
        }
    }

    async fn mark_deprovisioned(&self, instance: &mut ServiceInstance) -> Result<(), ReconcileError> {
        let status = status_mut(instance);
        clear_operation(status);
        status.provisioned = false;
        status.deprovision_status = DeprovisionStatus::Succeeded;
        status.set_ready(
            false,
            reason::DEPROVISIONED_SUCCESSFULLY,
            "The instance was deprovisioned successfully",
        );
        self.save(instance).await?;
        info!("instance deprovisioned");
        Ok(())
    }

    /// Drop the finalizer so the store can remove the record
    async fn release(&self, instance: &ServiceInstance) -> Result<(), ReconcileError> {
        remove_finalizer(self.ctx.stores.instances.as_ref(), instance).await?;
        self.ctx.reset_poll(KIND, &ObjectKey::of(instance));
        debug!("finalizer removed");
        Ok(())
    }
}

#[async_trait]
impl Reconcile for InstanceReconciler {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "controller.instance.reconcile",
            resource.kind = KIND,
            resource.namespace = %key.namespace,
            resource.name = %key.name
        );
        self.reconcile_instance(key).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::status::CONDITION_FAILED;

    fn instance(generation: i64, observed: Option<i64>) -> ServiceInstance {
        let mut instance = ServiceInstance::new(
            "db",
            ServiceInstanceSpec {
                service_class_external_name: Some("postgres".to_string()),
                service_plan_external_name: Some("small".to_string()),
                service_class_name: None,
                service_plan_name: None,
                external_id: None,
                parameters: None,
                parameters_from: Vec::new(),
                user_info: None,
            },
        );
        instance.metadata.generation = Some(generation);
        instance.status = Some(ServiceInstanceStatus {
            observed_generation: observed,
            ..ServiceInstanceStatus::default()
        });
        instance
    }

    #[test]
    fn test_settled_requires_current_generation_and_outcome() {
        let mut i = instance(2, Some(2));
        assert!(!is_settled(&i));
        status_mut(&mut i).set_ready(true, reason::PROVISIONED_SUCCESSFULLY, "ok");
        assert!(is_settled(&i));

        let mut i = instance(3, Some(2));
        status_mut(&mut i).set_ready(true, reason::PROVISIONED_SUCCESSFULLY, "ok");
        assert!(!is_settled(&i));

        let mut i = instance(2, Some(2));
        status_mut(&mut i).set_failed(reason::PROVISION_CALL_FAILED, "rejected");
        assert!(is_settled(&i));
    }

    #[test]
    fn test_failed_operation_observes_the_generation_that_started_it() {
        let mut status = ServiceInstanceStatus::default();
        start_operation(&mut status, InstanceOperation::Update, Some(4));
        status.in_progress_properties = Some(InstanceProperties::default());
        fail_operation(&mut status, reason::UPDATE_INSTANCE_CALL_FAILED, "Status: 400");

        assert_eq!(status.observed_generation, Some(4));
        assert!(status.current_operation.is_none());
        assert!(status.in_progress_properties.is_none());
        assert!(find_condition(&status.conditions, CONDITION_FAILED).is_some_and(|c| c.is_true()));
    }

    #[test]
    fn test_finish_provision_promotes_in_progress_properties() {
        let mut status = ServiceInstanceStatus::default();
        start_operation(&mut status, InstanceOperation::Provision, Some(1));
        status.in_progress_properties = Some(InstanceProperties {
            service_plan_external_id: "plan-1".to_string(),
            parameters_checksum: Some("abc".to_string()),
        });
        status.async_op_in_progress = true;
        finish_provision(&mut status);

        assert!(status.provisioned);
        assert!(!status.async_op_in_progress);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(
            status.external_properties.unwrap().service_plan_external_id,
            "plan-1"
        );
        assert_eq!(status.last_condition_state.as_deref(), Some(CONDITION_READY));
    }

    #[test]
    fn test_user_specified_names_prefer_external_names() {
        let mut spec = instance(1, None).spec;
        assert_eq!(user_specified_class(&spec), "postgres");
        spec.service_class_external_name = None;
        spec.service_class_name = Some("clusterserviceclass-12345".to_string());
        assert_eq!(user_specified_class(&spec), "clusterserviceclass-12345");
    }
}
