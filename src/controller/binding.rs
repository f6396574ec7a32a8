//! # Binding Reconciler
//!
//! Drives a ServiceBinding through bind, credential injection and unbind.
//!
//! Bindings are immutable once created, so there is no update path. A binding only
//! proceeds once its instance is Ready; instance events re-enqueue waiting bindings.
//! Credentials returned by the broker pass through the binding's secret transforms
//! and land in an Opaque secret owned by the binding.

use crate::broker::{
    BindRequest, BindResponse, BindingLastOperationRequest, BrokerClient, BrokerError, CallKind,
    ClientError, Credentials, GetBindingRequest, LastOperationResponse, LastOperationState,
    Outcome, UnbindRequest, UnbindResponse,
};
use crate::constants::FINALIZER;
use crate::controller::dispatcher::Reconcile;
use crate::controller::finalizer::{has_finalizer, remove_finalizer};
use crate::controller::parameters::resolve_parameters;
use crate::controller::status::{
    find_condition, now, reason, ConditionedStatus, CONDITION_READY,
};
use crate::controller::transform::{credentials_to_secret_data, transform_secret, SecretData};
use crate::controller::types::{Context, ReconcileAction, ReconcileError};
use crate::crd::{
    BindingOperation, BindingProperties, ServiceBinding, ServiceBindingStatus, ServiceInstance,
    UnbindStatus,
};
use crate::observability::metrics;
use crate::store::{is_deleting, ObjectKey};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

pub const KIND: &str = "binding";

struct Target {
    client: Arc<dyn BrokerClient>,
    instance_id: String,
    service_id: String,
    plan_id: String,
}

enum PollResult {
    InProgress,
    Resolved,
}

fn status_mut(binding: &mut ServiceBinding) -> &mut ServiceBindingStatus {
    binding
        .status
        .get_or_insert_with(ServiceBindingStatus::default)
}

fn binding_id(binding: &ServiceBinding) -> String {
    binding.spec.external_id.clone().unwrap_or_default()
}

fn namespace_of(binding: &ServiceBinding) -> String {
    binding.namespace().unwrap_or_else(|| "default".to_string())
}

fn secret_name(binding: &ServiceBinding) -> String {
    binding
        .spec
        .secret_name
        .clone()
        .unwrap_or_else(|| binding.name_any())
}

fn is_settled(binding: &ServiceBinding) -> bool {
    let Some(status) = binding.status.as_ref() else {
        return false;
    };
    status.observed_generation.is_some()
        && status.observed_generation == binding.metadata.generation
        && (status.is_ready() || status.is_failed())
}

fn clear_operation(status: &mut ServiceBindingStatus) {
    status.async_op_in_progress = false;
    status.last_operation = None;
    status.current_operation = None;
    status.operation_start_time = None;
}

fn start_operation(status: &mut ServiceBindingStatus, operation: BindingOperation) {
    status.current_operation = Some(operation);
    status.operation_start_time = Some(now());
}

fn fail_binding(binding: &mut ServiceBinding, reason: &str, message: &str) {
    let generation = binding.metadata.generation;
    let status = status_mut(binding);
    clear_operation(status);
    status.observed_generation = generation;
    status.set_failed(reason, message);
}

/// Whether a secret carries an owner reference to this binding
fn owned_by(secret: &Secret, binding: &ServiceBinding) -> bool {
    let Some(uid) = binding.metadata.uid.as_deref() else {
        return false;
    };
    secret
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
}

fn owner_reference(binding: &ServiceBinding) -> OwnerReference {
    OwnerReference {
        api_version: ServiceBinding::api_version(&()).to_string(),
        kind: ServiceBinding::kind(&()).to_string(),
        name: binding.name_any(),
        uid: binding.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[derive(Debug)]
pub struct BindingReconciler {
    ctx: Arc<Context>,
}

impl BindingReconciler {
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn reconcile_binding(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let Some(binding) = self.ctx.stores.bindings.get(key).await? else {
            self.ctx.reset_poll(KIND, key);
            return Ok(ReconcileAction::Done);
        };

        if is_deleting(&binding) {
            return self.reconcile_delete(binding).await;
        }

        let mut binding = self.prepare(binding).await?;
        let current = binding.status.clone().unwrap_or_default();

        if current.async_op_in_progress {
            let Some(target) = self.target_for(&mut binding).await? else {
                return Ok(ReconcileAction::Retry);
            };
            return match self.poll(&mut binding, &target, false).await? {
                PollResult::InProgress => Ok(self.poll_later(key)),
                PollResult::Resolved => Ok(self.after_resolution(&binding)),
            };
        }

        if current.orphan_mitigation_in_progress {
            let Some(target) = self.target_for(&mut binding).await? else {
                return Ok(ReconcileAction::Retry);
            };
            return Ok(self
                .mitigate_orphan(&mut binding, &target)
                .await?
                .unwrap_or(ReconcileAction::Retry));
        }

        if is_settled(&binding) {
            debug!("binding is up to date");
            return Ok(ReconcileAction::Done);
        }

        let Some(instance) = self.load_instance(&mut binding).await? else {
            return Ok(ReconcileAction::Retry);
        };
        let instance_ready = instance.status.as_ref().is_some_and(ConditionedStatus::is_ready);
        if !instance_ready || is_deleting(&instance) {
            let message = format!(
                "Binding cannot begin because the referenced ServiceInstance {:?} is not ready",
                instance.name_any()
            );
            let waiting = binding.status.as_ref().and_then(|s| s.ready_reason())
                == Some(reason::ERROR_INSTANCE_NOT_READY);
            if !waiting {
                info!("{}", message);
                self.set_not_ready(&mut binding, reason::ERROR_INSTANCE_NOT_READY, &message)
                    .await?;
            }
            return Ok(ReconcileAction::Done);
        }

        let Some((target, bindable)) = self.resolve_target(&mut binding, &instance).await? else {
            return Ok(ReconcileAction::Retry);
        };
        if !bindable {
            let message = format!(
                "The binding references a ServiceInstance {:?} whose class and plan are not bindable",
                instance.name_any()
            );
            warn!("{}", message);
            fail_binding(&mut binding, reason::ERROR_NONBINDABLE_SERVICE_CLASS, &message);
            self.save(&mut binding).await?;
            return Ok(ReconcileAction::Done);
        }

        self.bind(&mut binding, &instance, &target).await
    }

    /// Assign the external ID and finalizer in one write
    async fn prepare(&self, binding: ServiceBinding) -> Result<ServiceBinding, ReconcileError> {
        if has_finalizer(&binding) && binding.spec.external_id.is_some() {
            return Ok(binding);
        }
        let mut updated = binding;
        if updated.spec.external_id.is_none() {
            updated.spec.external_id = Some(uuid::Uuid::new_v4().to_string());
        }
        if !has_finalizer(&updated) {
            updated
                .meta_mut()
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(FINALIZER.to_string());
        }
        Ok(self.ctx.stores.bindings.update(&updated).await?)
    }

    fn poll_later(&self, key: &ObjectKey) -> ReconcileAction {
        ReconcileAction::RequeueAfter(self.ctx.next_poll_delay(KIND, key))
    }

    fn after_resolution(&self, binding: &ServiceBinding) -> ReconcileAction {
        self.ctx.reset_poll(KIND, &ObjectKey::of(binding));
        if is_settled(binding) {
            ReconcileAction::Done
        } else {
            ReconcileAction::Retry
        }
    }

    async fn save(&self, binding: &mut ServiceBinding) -> Result<(), ReconcileError> {
        *binding = self.ctx.stores.bindings.update_status(binding).await?;
        Ok(())
    }

    async fn set_not_ready(
        &self,
        binding: &mut ServiceBinding,
        reason: &str,
        message: &str,
    ) -> Result<(), ReconcileError> {
        status_mut(binding).set_ready(false, reason, message);
        self.save(binding).await
    }

    // ========================================================================
    // References
    // ========================================================================

    async fn load_instance(
        &self,
        binding: &mut ServiceBinding,
    ) -> Result<Option<ServiceInstance>, ReconcileError> {
        let name = binding.spec.instance_ref.name.clone();
        let key = ObjectKey::new(namespace_of(binding), &name);
        let instance = self.ctx.stores.instances.get(&key).await?;
        if instance.is_none() {
            let message = format!("The binding references a non-existent ServiceInstance {name:?}");
            warn!("{}", message);
            self.set_not_ready(binding, reason::REFERENCES_NONEXISTENT_INSTANCE, &message)
                .await?;
        }
        Ok(instance)
    }

    /// Broker target through the instance's resolved class and plan, plus effective bindability
    async fn resolve_target(
        &self,
        binding: &mut ServiceBinding,
        instance: &ServiceInstance,
    ) -> Result<Option<(Target, bool)>, ReconcileError> {
        let namespace = namespace_of(binding);
        let instance_status = instance.status.clone().unwrap_or_default();

        let class = match instance_status.service_class_ref.as_deref() {
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
                "The ServiceInstance {:?} references a non-existent ServiceClass",
                instance.name_any()
            );
            self.set_not_ready(binding, reason::REFERENCES_NONEXISTENT_SERVICE_CLASS, &message)
                .await?;
            return Ok(None);
        };
        let plan = match instance_status.service_plan_ref.as_deref() {
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
                "The ServiceInstance {:?} references a non-existent ServicePlan",
                instance.name_any()
            );
            self.set_not_ready(binding, reason::REFERENCES_NONEXISTENT_SERVICE_PLAN, &message)
                .await?;
            return Ok(None);
        };

        let Some(client) = self.client_for(binding, &class.spec.broker_name).await? else {
            return Ok(None);
        };
        let plan_id = instance_status
            .external_properties
            .map(|p| p.service_plan_external_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| plan.spec.external_id.clone());
        let bindable = plan.is_bindable(&class);
        Ok(Some((
            Target {
                client,
                instance_id: instance.spec.external_id.clone().unwrap_or_default(),
                service_id: class.spec.external_id,
                plan_id,
            },
            bindable,
        )))
    }

    /// Target for an operation already started by an earlier pass
    async fn target_for(
        &self,
        binding: &mut ServiceBinding,
    ) -> Result<Option<Target>, ReconcileError> {
        let Some(instance) = self.load_instance(binding).await? else {
            return Ok(None);
        };
        Ok(self
            .resolve_target(binding, &instance)
            .await?
            .map(|(target, _)| target))
    }

    async fn client_for(
        &self,
        binding: &mut ServiceBinding,
        broker_name: &str,
    ) -> Result<Option<Arc<dyn BrokerClient>>, ReconcileError> {
        let key = ObjectKey::new(namespace_of(binding), broker_name);
        let Some(broker) = self.ctx.stores.brokers.get(&key).await? else {
            let message = format!("The binding references a non-existent broker {broker_name:?}");
            self.set_not_ready(binding, reason::REFERENCES_NONEXISTENT_BROKER, &message)
                .await?;
            return Ok(None);
        };
        match self.ctx.clients.get_client(&broker).await {
            Ok(client) => Ok(Some(client)),
            Err(ClientError::Auth(e)) => {
                let message =
                    format!("Error getting broker auth credentials for broker {broker_name:?}: {e}");
                self.set_not_ready(binding, reason::ERROR_GETTING_AUTH_CREDENTIALS, &message)
                    .await?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Bind
    // ========================================================================

    async fn bind(
        &self,
        binding: &mut ServiceBinding,
        instance: &ServiceInstance,
        target: &Target,
    ) -> Result<ReconcileAction, ReconcileError> {
        let namespace = namespace_of(binding);
        let resolved = match resolve_parameters(
            self.ctx.stores.secrets.as_ref(),
            &namespace,
            binding.spec.parameters.as_ref(),
            &binding.spec.parameters_from,
        )
        .await
        {
            Ok(resolved) => resolved,
            Err(e) if e.is_terminal() => {
                warn!("failed to prepare parameters: {}", e);
                fail_binding(
                    binding,
                    reason::ERROR_WITH_PARAMETERS,
                    &format!("Failed to prepare ServiceBinding parameters: {e}"),
                );
                self.save(binding).await?;
                return Ok(ReconcileAction::Done);
            }
            Err(e) => return Err(ReconcileError::Transient(e.to_string())),
        };

        let status = status_mut(binding);
        start_operation(status, BindingOperation::Bind);
        status.unbind_status = UnbindStatus::Required;
        status.set_ready(
            false,
            reason::BINDING,
            "Bind request for the binding is in flight to the broker",
        );
        self.save(binding).await?;

        let request = BindRequest {
            binding_id: binding_id(binding),
            instance_id: target.instance_id.clone(),
            service_id: target.service_id.clone(),
            plan_id: target.plan_id.clone(),
            parameters: resolved.parameters,
            context: self.ctx.request_context(&namespace, &instance.name_any()),
            accepts_incomplete: self.ctx.config.async_binding_operations,
            originating_identity: self.ctx.originating_identity(binding.spec.user_info.as_ref()),
        };
        info!(instance = %instance.name_any(), "binding");

        match target.client.bind(&request).await {
            Ok(BindResponse::Completed { credentials }) => {
                self.inject(binding, &credentials, resolved.checksum).await
            }
            Ok(BindResponse::InProgress { operation }) => {
                let status = status_mut(binding);
                status.async_op_in_progress = true;
                status.last_operation = operation;
                status.external_properties = Some(BindingProperties {
                    parameters_checksum: resolved.checksum,
                });
                status.set_ready(false, reason::BINDING, "The binding is being created asynchronously");
                self.save(binding).await?;
                Ok(self.poll_later(&ObjectKey::of(binding)))
            }
            Err(e) => self.bind_failed(binding, target, e).await,
        }
    }

    async fn bind_failed(
        &self,
        binding: &mut ServiceBinding,
        target: &Target,
        error: BrokerError,
    ) -> Result<ReconcileAction, ReconcileError> {
        let message = format!("Error creating the binding: {error}");
        match error.classify(CallKind::Bind) {
            Outcome::Transient => {
                warn!("{}", message);
                let status = status_mut(binding);
                clear_operation(status);
                status.set_ready(false, reason::BIND_CALL_FAILED, &message);
                self.save(binding).await?;
                Err(error.into())
            }
            Outcome::Rejected => {
                warn!("bind rejected by the broker: {}", error);
                status_mut(binding).unbind_status = UnbindStatus::NotRequired;
                fail_binding(binding, reason::BIND_CALL_FAILED, &message);
                self.save(binding).await?;
                Ok(ReconcileAction::Done)
            }
            Outcome::Ambiguous => {
                warn!("bind outcome unknown, starting orphan mitigation: {}", error);
                metrics::increment_orphan_mitigations(KIND);
                let status = status_mut(binding);
                clear_operation(status);
                status.orphan_mitigation_in_progress = true;
                status.set_ready(
                    false,
                    reason::STARTING_ORPHAN_MITIGATION,
                    &format!(
                        "The bind call failed with an ambiguous error; unbinding to avoid orphaned credentials: {error}"
                    ),
                );
                self.save(binding).await?;
                Ok(self
                    .mitigate_orphan(binding, target)
                    .await?
                    .unwrap_or(ReconcileAction::Retry))
            }
        }
    }

    /// Shape the credentials and write them to the binding's secret
    async fn inject(
        &self,
        binding: &mut ServiceBinding,
        credentials: &Credentials,
        checksum: Option<String>,
    ) -> Result<ReconcileAction, ReconcileError> {
        let namespace = namespace_of(binding);
        let data = match transform_secret(
            self.ctx.stores.secrets.as_ref(),
            &namespace,
            credentials_to_secret_data(credentials),
            &binding.spec.secret_transforms,
        )
        .await
        {
            Ok(data) => data,
            Err(e) if e.is_terminal() => {
                warn!("failed to transform bind result: {}", e);
                fail_binding(
                    binding,
                    reason::ERROR_WITH_PARAMETERS,
                    &format!("Failed to apply secret transforms to the bind result: {e}"),
                );
                self.save(binding).await?;
                return Ok(ReconcileAction::Done);
            }
            Err(e) => return Err(ReconcileError::Transient(e.to_string())),
        };

        if let Err(message) = self.write_secret(binding, data).await? {
            warn!("{}", message);
            let status = status_mut(binding);
            clear_operation(status);
            status.set_ready(false, reason::ERROR_INJECTING_BIND_RESULT, &message);
            self.save(binding).await?;
            return Err(ReconcileError::Transient(message));
        }

        let generation = binding.metadata.generation;
        let status = status_mut(binding);
        clear_operation(status);
        status.external_properties = Some(BindingProperties {
            parameters_checksum: checksum,
        });
        status.observed_generation = generation;
        status.clear_failed();
        status.set_ready(true, reason::INJECTED_BIND_RESULT, "Injected bind result");
        self.save(binding).await?;
        self.ctx.reset_poll(KIND, &ObjectKey::of(binding));
        info!(secret = %secret_name(binding), "injected bind result");
        Ok(ReconcileAction::Done)
    }

    /// Create or refresh the credentials secret; `Err(message)` when another owner holds the name
    async fn write_secret(
        &self,
        binding: &ServiceBinding,
        data: SecretData,
    ) -> Result<Result<(), String>, ReconcileError> {
        let name = secret_name(binding);
        let key = ObjectKey::new(namespace_of(binding), &name);
        let data = data
            .into_iter()
            .map(|(k, v)| (k, ByteString(v)))
            .collect();

        match self.ctx.stores.secrets.get(&key).await? {
            Some(existing) if owned_by(&existing, binding) => {
                let mut updated = existing;
                updated.data = Some(data);
                updated.string_data = None;
                self.ctx.stores.secrets.update(&updated).await?;
                debug!(secret = %name, "updated credentials secret");
            }
            Some(_) => {
                return Ok(Err(format!(
                    "Secret {name:?} already exists and is not owned by this binding"
                )));
            }
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(key.namespace.clone()),
                        owner_references: Some(vec![owner_reference(binding)]),
                        ..ObjectMeta::default()
                    },
                    type_: Some("Opaque".to_string()),
                    data: Some(data),
                    ..Secret::default()
                };
                self.ctx.stores.secrets.create(&secret).await?;
                debug!(secret = %name, "created credentials secret");
            }
        }
        Ok(Ok(()))
    }

    async fn delete_secret(&self, binding: &ServiceBinding) -> Result<(), ReconcileError> {
        let key = ObjectKey::new(namespace_of(binding), secret_name(binding));
        if let Some(secret) = self.ctx.stores.secrets.get(&key).await? {
            if owned_by(&secret, binding) {
                self.ctx.stores.secrets.delete(&key).await?;
                debug!(secret = %key, "deleted credentials secret");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Orphan mitigation and unbind
    // ========================================================================

    fn unbind_request(&self, binding: &ServiceBinding, target: &Target) -> UnbindRequest {
        UnbindRequest {
            binding_id: binding_id(binding),
            instance_id: target.instance_id.clone(),
            service_id: target.service_id.clone(),
            plan_id: target.plan_id.clone(),
            accepts_incomplete: self.ctx.config.async_binding_operations,
            originating_identity: self.ctx.originating_identity(binding.spec.user_info.as_ref()),
        }
    }

    /// Unbind after an ambiguous bind; `None` once the broker confirmed it
    async fn mitigate_orphan(
        &self,
        binding: &mut ServiceBinding,
        target: &Target,
    ) -> Result<Option<ReconcileAction>, ReconcileError> {
        let request = self.unbind_request(binding, target);
        match target.client.unbind(&request).await {
            Ok(UnbindResponse::Completed) => {
                self.orphan_mitigated(binding).await?;
                Ok(None)
            }
            Ok(UnbindResponse::InProgress { operation }) => {
                let status = status_mut(binding);
                start_operation(status, BindingOperation::Unbind);
                status.async_op_in_progress = true;
                status.last_operation = operation;
                status.unbind_status = UnbindStatus::InProgress;
                status.set_ready(
                    false,
                    reason::STARTING_ORPHAN_MITIGATION,
                    "Orphan mitigation is unbinding asynchronously",
                );
                self.save(binding).await?;
                Ok(Some(self.poll_later(&ObjectKey::of(binding))))
            }
            Err(e) if e.is_gone() => {
                self.orphan_mitigated(binding).await?;
                Ok(None)
            }
            Err(e) => {
                warn!("orphan mitigation failed: {}", e);
                self.set_not_ready(
                    binding,
                    reason::ORPHAN_MITIGATION_FAILED,
                    &format!("Orphan mitigation failed: {e}"),
                )
                .await?;
                Err(e.into())
            }
        }
    }

    async fn orphan_mitigated(&self, binding: &mut ServiceBinding) -> Result<(), ReconcileError> {
        let status = status_mut(binding);
        clear_operation(status);
        status.orphan_mitigation_in_progress = false;
        status.unbind_status = UnbindStatus::NotRequired;
        status.set_ready(
            false,
            reason::ORPHAN_MITIGATION_SUCCESSFUL,
            "Orphan mitigation was completed successfully",
        );
        self.save(binding).await?;
        self.ctx.reset_poll(KIND, &ObjectKey::of(binding));
        info!("orphan mitigation completed");
        Ok(())
    }

    async fn unbind(&self, binding: &mut ServiceBinding) -> Result<ReconcileAction, ReconcileError> {
        let Some(target) = self.target_for(binding).await? else {
            return Ok(ReconcileAction::Retry);
        };

        let status = status_mut(binding);
        start_operation(status, BindingOperation::Unbind);
        status.set_ready(
            false,
            reason::UNBINDING,
            "Unbind request for the binding is in flight to the broker",
        );
        self.save(binding).await?;

        let request = self.unbind_request(binding, &target);
        info!("unbinding");
        match target.client.unbind(&request).await {
            Ok(UnbindResponse::Completed) => {
                self.mark_unbound(binding).await?;
                self.release(binding).await?;
                Ok(ReconcileAction::Done)
            }
            Ok(UnbindResponse::InProgress { operation }) => {
                let status = status_mut(binding);
                status.async_op_in_progress = true;
                status.last_operation = operation;
                status.unbind_status = UnbindStatus::InProgress;
                status.set_ready(false, reason::UNBINDING, "The binding is being deleted asynchronously");
                self.save(binding).await?;
                Ok(self.poll_later(&ObjectKey::of(binding)))
            }
            Err(e) if e.is_gone() => {
                self.mark_unbound(binding).await?;
                self.release(binding).await?;
                Ok(ReconcileAction::Done)
            }
            Err(e) => {
                let message = format!("Error unbinding: {e}");
                if e.classify(CallKind::Unbind) == Outcome::Rejected {
                    warn!("unbind rejected by the broker: {}", e);
                    let status = status_mut(binding);
                    clear_operation(status);
                    status.unbind_status = UnbindStatus::Failed;
                    status.set_failed(reason::UNBIND_CALL_FAILED, &message);
                    self.save(binding).await?;
                    return Ok(ReconcileAction::Done);
                }
                let status = status_mut(binding);
                clear_operation(status);
                status.set_ready(false, reason::UNBIND_CALL_FAILED, &message);
                self.save(binding).await?;
                Err(e.into())
            }
        }
    }

    async fn mark_unbound(&self, binding: &mut ServiceBinding) -> Result<(), ReconcileError> {
        self.delete_secret(binding).await?;
        let status = status_mut(binding);
        clear_operation(status);
        status.unbind_status = UnbindStatus::Succeeded;
        status.set_ready(
            false,
            reason::UNBOUND_SUCCESSFULLY,
            "The binding was deleted successfully",
        );
        self.save(binding).await?;
        info!("unbound");
        Ok(())
    }

    async fn release(&self, binding: &ServiceBinding) -> Result<(), ReconcileError> {
        remove_finalizer(self.ctx.stores.bindings.as_ref(), binding).await?;
        self.ctx.reset_poll(KIND, &ObjectKey::of(binding));
        Ok(())
    }

    // ========================================================================
    // Poll
    // ========================================================================

    /// Poll the operation in flight; while deleting, a finished bind is not injected
    async fn poll(
        &self,
        binding: &mut ServiceBinding,
        target: &Target,
        deleting: bool,
    ) -> Result<PollResult, ReconcileError> {
        let current = binding.status.clone().unwrap_or_default();
        let operation = current.current_operation.unwrap_or(BindingOperation::Bind);
        let request = BindingLastOperationRequest {
            instance_id: target.instance_id.clone(),
            binding_id: binding_id(binding),
            service_id: Some(target.service_id.clone()),
            plan_id: Some(target.plan_id.clone()),
            operation: current.last_operation.clone(),
            originating_identity: self.ctx.originating_identity(binding.spec.user_info.as_ref()),
        };

        let response = match target.client.poll_binding_last_operation(&request).await {
            Ok(response) => response,
            Err(e) if e.is_gone() && operation == BindingOperation::Unbind => {
                LastOperationResponse {
                    state: LastOperationState::Succeeded,
                    description: None,
                }
            }
            Err(e) => {
                self.set_not_ready(
                    binding,
                    reason::ERROR_POLLING_LAST_OPERATION,
                    &format!("Error polling last operation: {e}"),
                )
                .await?;
                return Err(e.into());
            }
        };
        let description = response.description.unwrap_or_default();
        debug!(operation = ?operation, state = ?response.state, "polled binding last operation");

        match (response.state, operation) {
            (LastOperationState::InProgress, _) => {
                let (reason, message) = match operation {
                    BindingOperation::Bind => {
                        (reason::BINDING, "The binding is being created asynchronously")
                    }
                    BindingOperation::Unbind => {
                        (reason::UNBINDING, "The binding is being deleted asynchronously")
                    }
                };
                let message = if description.is_empty() {
                    message.to_string()
                } else {
                    format!("{message} ({description})")
                };
                let status = status_mut(binding);
                let unchanged = find_condition(&status.conditions, CONDITION_READY)
                    .is_some_and(|c| c.message.as_deref() == Some(message.as_str()));
                if !unchanged {
                    status.set_ready(false, reason, &message);
                    self.save(binding).await?;
                }
                return Ok(PollResult::InProgress);
            }
            (LastOperationState::Succeeded, BindingOperation::Bind) if deleting => {
                clear_operation(status_mut(binding));
                self.save(binding).await?;
            }
            (LastOperationState::Succeeded, BindingOperation::Bind) => {
                let request = GetBindingRequest {
                    instance_id: target.instance_id.clone(),
                    binding_id: binding_id(binding),
                };
                let fetched = match target.client.get_binding(&request).await {
                    Ok(fetched) => fetched,
                    Err(e) => {
                        self.set_not_ready(
                            binding,
                            reason::BIND_CALL_FAILED,
                            &format!("Error fetching binding credentials: {e}"),
                        )
                        .await?;
                        return Err(e.into());
                    }
                };
                let checksum = current
                    .external_properties
                    .and_then(|p| p.parameters_checksum);
                self.inject(binding, &fetched.credentials, checksum).await?;
            }
            (LastOperationState::Failed, BindingOperation::Bind) => {
                warn!("asynchronous bind failed: {}", description);
                fail_binding(
                    binding,
                    reason::BIND_CALL_FAILED,
                    &format!("Asynchronous bind failed: {description}"),
                );
                self.save(binding).await?;
            }
            (LastOperationState::Succeeded, BindingOperation::Unbind) => {
                if current.orphan_mitigation_in_progress {
                    self.orphan_mitigated(binding).await?;
                } else {
                    self.mark_unbound(binding).await?;
                }
            }
            (LastOperationState::Failed, BindingOperation::Unbind) => {
                let message = format!("Asynchronous unbind failed: {description}");
                warn!("{}", message);
                let status = status_mut(binding);
                clear_operation(status);
                status.unbind_status = UnbindStatus::Required;
                status.set_ready(false, reason::UNBIND_CALL_FAILED, &message);
                self.save(binding).await?;
                self.ctx.reset_poll(KIND, &ObjectKey::of(binding));
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
        binding: ServiceBinding,
    ) -> Result<ReconcileAction, ReconcileError> {
        if !has_finalizer(&binding) {
            return Ok(ReconcileAction::Done);
        }
        let key = ObjectKey::of(&binding);
        let mut binding = binding;

        let in_flight = binding
            .status
            .as_ref()
            .is_some_and(|s| s.async_op_in_progress);
        if in_flight {
            let Some(target) = self.target_for(&mut binding).await? else {
                return Ok(ReconcileAction::Retry);
            };
            if let PollResult::InProgress = self.poll(&mut binding, &target, true).await? {
                return Ok(self.poll_later(&key));
            }
        }

        let mitigating = binding
            .status
            .as_ref()
            .is_some_and(|s| s.orphan_mitigation_in_progress);
        if mitigating {
            let Some(target) = self.target_for(&mut binding).await? else {
                return Ok(ReconcileAction::Retry);
            };
            if let Some(action) = self.mitigate_orphan(&mut binding, &target).await? {
                return Ok(action);
            }
        }

        let unbind_status = binding
            .status
            .as_ref()
            .map(|s| s.unbind_status)
            .unwrap_or_default();
        match unbind_status {
            UnbindStatus::NotRequired | UnbindStatus::Succeeded => {
                self.release(&binding).await?;
                Ok(ReconcileAction::Done)
            }
            UnbindStatus::Failed => {
                debug!("unbind failed permanently, keeping finalizer");
                Ok(ReconcileAction::Done)
            }
            UnbindStatus::Required | UnbindStatus::InProgress => self.unbind(&mut binding).await,
        }
    }
}

#[async_trait]
impl Reconcile for BindingReconciler {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let span = tracing::span!(
            tracing::Level::INFO,
            "controller.binding.reconcile",
            resource.kind = KIND,
            resource.namespace = %key.namespace,
            resource.name = %key.name
        );
        self.reconcile_binding(key).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LocalObjectReference, ServiceBindingSpec};

    fn binding() -> ServiceBinding {
        let mut binding = ServiceBinding::new(
            "creds",
            ServiceBindingSpec {
                instance_ref: LocalObjectReference {
                    name: "db".to_string(),
                },
                external_id: None,
                parameters: None,
                parameters_from: Vec::new(),
                secret_name: None,
                secret_transforms: Vec::new(),
                user_info: None,
            },
        );
        binding.metadata.namespace = Some("default".to_string());
        binding.metadata.uid = Some("binding-uid".to_string());
        binding
    }

    #[test]
    fn test_secret_name_defaults_to_binding_name() {
        let mut b = binding();
        assert_eq!(secret_name(&b), "creds");
        b.spec.secret_name = Some("db-credentials".to_string());
        assert_eq!(secret_name(&b), "db-credentials");
    }

    #[test]
    fn test_secret_ownership_follows_owner_reference_uid() {
        let b = binding();
        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some("creds".to_string()),
                owner_references: Some(vec![owner_reference(&b)]),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };
        assert!(owned_by(&secret, &b));
        assert_eq!(
            secret.metadata.owner_references.as_ref().unwrap()[0].kind,
            "ServiceBinding"
        );

        secret.metadata.owner_references = None;
        assert!(!owned_by(&secret, &b));
    }

    #[test]
    fn test_fail_binding_observes_generation() {
        let mut b = binding();
        b.metadata.generation = Some(1);
        status_mut(&mut b).async_op_in_progress = true;
        fail_binding(&mut b, reason::ERROR_NONBINDABLE_SERVICE_CLASS, "not bindable");

        let status = b.status.as_ref().unwrap();
        assert!(status.is_failed());
        assert!(!status.async_op_in_progress);
        assert!(is_settled(&b));
        assert_eq!(
            status.last_condition_state.as_deref(),
            Some(reason::ERROR_NONBINDABLE_SERVICE_CLASS)
        );
    }
}
