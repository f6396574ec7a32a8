//! Shared harness for the controller flow tests
//!
//! Runs the real watch wiring and dispatchers over in-memory stores, with a
//! scripted [`FakeBrokerClient`] standing in for the broker.

#![allow(dead_code, reason = "Each test binary uses a different subset of the harness")]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde_json::{json, Map, Value};
use service_catalog_controller::broker::{
    BindRequest, BindResponse, BindingLastOperationRequest, BrokerClient, BrokerClientConfig,
    BrokerClientFactory, BrokerClientManager, BrokerError, CatalogResponse, Credentials,
    DeprovisionRequest, DeprovisionResponse, GetBindingRequest, GetBindingResponse,
    LastOperationRequest, LastOperationResponse, LastOperationState, Plan, ProvisionRequest,
    ProvisionResponse, Service, UnbindRequest, UnbindResponse, UpdateRequest, UpdateResponse,
};
use service_catalog_controller::config::ControllerConfig;
use service_catalog_controller::controller::status::ConditionedStatus;
use service_catalog_controller::controller::Context;
use service_catalog_controller::crd::{
    LocalObjectReference, RelistBehavior, ServiceBinding, ServiceBindingSpec, ServiceBroker,
    ServiceBrokerSpec, ServiceClass, ServiceInstance, ServiceInstanceSpec, ServicePlan,
};
use service_catalog_controller::runtime::ControllerSet;
use service_catalog_controller::store::{ObjectKey, Stores};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static RUSTLS_INIT: Once = Once::new();

/// Install the ring provider once per test binary
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

pub const NAMESPACE: &str = "test-ns";
pub const BROKER_NAME: &str = "test-broker";
pub const CLASS_ID: &str = "clusterserviceclass-12345";
pub const CLASS_EXTERNAL_NAME: &str = "test-clusterserviceclass";
pub const PLAN_ID: &str = "34567";
pub const PLAN_EXTERNAL_NAME: &str = "test-plan";
pub const NONBINDABLE_PLAN_ID: &str = "nb34567";
pub const NONBINDABLE_PLAN_EXTERNAL_NAME: &str = "test-unbindable-plan";

/// Finalizer tests add to keep a deleted record visible
pub const HOLD_FINALIZER: &str = "test.servicecatalog.octopilot.io/hold";

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_STEP: Duration = Duration::from_millis(10);

// ============================================================================
// Fixtures
// ============================================================================

pub fn credentials() -> Credentials {
    let mut credentials = Map::new();
    credentials.insert("foo".to_string(), json!("bar"));
    credentials.insert("baz".to_string(), json!("zap"));
    credentials
}

pub fn catalog() -> CatalogResponse {
    CatalogResponse {
        services: vec![Service {
            id: CLASS_ID.to_string(),
            name: CLASS_EXTERNAL_NAME.to_string(),
            description: "a test service".to_string(),
            bindable: true,
            plan_updateable: Some(true),
            tags: Vec::new(),
            metadata: None,
            plans: vec![
                Plan {
                    id: PLAN_ID.to_string(),
                    name: PLAN_EXTERNAL_NAME.to_string(),
                    description: "a test plan".to_string(),
                    free: Some(true),
                    bindable: None,
                    metadata: None,
                },
                Plan {
                    id: NONBINDABLE_PLAN_ID.to_string(),
                    name: NONBINDABLE_PLAN_EXTERNAL_NAME.to_string(),
                    description: "a plan that cannot be bound".to_string(),
                    free: Some(false),
                    bindable: Some(false),
                    metadata: None,
                },
            ],
        }],
    }
}

pub fn broker_spec() -> ServiceBrokerSpec {
    ServiceBrokerSpec {
        url: "http://broker.example".to_string(),
        ca_bundle: None,
        insecure_skip_tls_verify: false,
        auth_info: None,
        relist_behavior: RelistBehavior::Duration,
        relist_duration: "15m".to_string(),
        relist_requests: 0,
        catalog_restrictions: None,
    }
}

pub fn instance_spec(plan_external_name: &str) -> ServiceInstanceSpec {
    ServiceInstanceSpec {
        service_class_external_name: Some(CLASS_EXTERNAL_NAME.to_string()),
        service_plan_external_name: Some(plan_external_name.to_string()),
        service_class_name: None,
        service_plan_name: None,
        external_id: None,
        parameters: None,
        parameters_from: Vec::new(),
        user_info: None,
    }
}

pub fn binding_spec(instance: &str) -> ServiceBindingSpec {
    ServiceBindingSpec {
        instance_ref: LocalObjectReference {
            name: instance.to_string(),
        },
        external_id: None,
        parameters: None,
        parameters_from: Vec::new(),
        secret_name: None,
        secret_transforms: Vec::new(),
        user_info: None,
    }
}

pub fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
    let data: BTreeMap<String, ByteString> = data
        .iter()
        .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
        .collect();
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Secret::default()
    }
}

pub fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
}

pub fn http_error(status: u16) -> BrokerError {
    BrokerError::HttpStatus {
        status,
        error_message: None,
        description: None,
    }
}

pub fn last_operation(state: LastOperationState) -> LastOperationResponse {
    LastOperationResponse {
        state,
        description: None,
    }
}

// ============================================================================
// Scripted broker
// ============================================================================

/// Replies for one broker operation
///
/// Attempt `n` gets step `n`; once the steps run out the last one repeats.
#[derive(Debug)]
pub struct Script<T> {
    steps: Vec<Result<T, BrokerError>>,
    attempts: usize,
}

impl<T: Clone> Script<T> {
    pub fn always(reply: Result<T, BrokerError>) -> Self {
        Self::steps(vec![reply])
    }

    pub fn steps(steps: Vec<Result<T, BrokerError>>) -> Self {
        assert!(!steps.is_empty(), "a script needs at least one step");
        Self { steps, attempts: 0 }
    }

    fn next(&mut self) -> Result<T, BrokerError> {
        let index = self.attempts.min(self.steps.len() - 1);
        self.attempts += 1;
        self.steps[index].clone()
    }
}

#[derive(Debug)]
pub struct Scripts {
    pub catalog: Script<CatalogResponse>,
    pub provision: Script<ProvisionResponse>,
    pub update: Script<UpdateResponse>,
    pub deprovision: Script<DeprovisionResponse>,
    pub poll_instance: Script<LastOperationResponse>,
    pub bind: Script<BindResponse>,
    pub unbind: Script<UnbindResponse>,
    pub poll_binding: Script<LastOperationResponse>,
    pub get_binding: Script<GetBindingResponse>,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            catalog: Script::always(Ok(catalog())),
            provision: Script::always(Ok(ProvisionResponse::Completed {
                dashboard_url: None,
            })),
            update: Script::always(Ok(UpdateResponse::Completed {
                dashboard_url: None,
            })),
            deprovision: Script::always(Ok(DeprovisionResponse::Completed)),
            poll_instance: Script::always(Ok(last_operation(LastOperationState::Succeeded))),
            bind: Script::always(Ok(BindResponse::Completed {
                credentials: credentials(),
            })),
            unbind: Script::always(Ok(UnbindResponse::Completed)),
            poll_binding: Script::always(Ok(last_operation(LastOperationState::Succeeded))),
            get_binding: Script::always(Ok(GetBindingResponse {
                credentials: credentials(),
            })),
        }
    }
}

/// A recorded broker call
#[derive(Debug, Clone)]
pub enum Call {
    Catalog,
    Provision(ProvisionRequest),
    Update(UpdateRequest),
    Deprovision(DeprovisionRequest),
    PollInstance(LastOperationRequest),
    Bind(BindRequest),
    Unbind(UnbindRequest),
    PollBinding(BindingLastOperationRequest),
    GetBinding(GetBindingRequest),
}

#[derive(Debug, Default)]
pub struct FakeBrokerClient {
    scripts: Mutex<Scripts>,
    calls: Mutex<Vec<Call>>,
}

impl FakeBrokerClient {
    /// Replace the replies of one or more operations
    pub fn script(&self, edit: impl FnOnce(&mut Scripts)) {
        edit(&mut self.scripts.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    /// Wait until at least `n` recorded calls match
    pub async fn wait_calls(&self, n: usize, matches: impl Fn(&Call) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let seen = self.count(&matches);
            if seen >= n {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("expected {n} matching broker calls, saw {seen}: {:#?}", self.calls());
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
    }

    pub fn provisions(&self) -> Vec<ProvisionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Provision(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<UpdateRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Update(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn binds(&self) -> Vec<BindRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Bind(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BrokerClient for FakeBrokerClient {
    async fn get_catalog(&self) -> Result<CatalogResponse, BrokerError> {
        self.record(Call::Catalog);
        self.scripts.lock().unwrap().catalog.next()
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, BrokerError> {
        self.record(Call::Provision(request.clone()));
        self.scripts.lock().unwrap().provision.next()
    }

    async fn update_instance(&self, request: &UpdateRequest) -> Result<UpdateResponse, BrokerError> {
        self.record(Call::Update(request.clone()));
        self.scripts.lock().unwrap().update.next()
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError> {
        self.record(Call::Deprovision(request.clone()));
        self.scripts.lock().unwrap().deprovision.next()
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        self.record(Call::PollInstance(request.clone()));
        self.scripts.lock().unwrap().poll_instance.next()
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError> {
        self.record(Call::Bind(request.clone()));
        self.scripts.lock().unwrap().bind.next()
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, BrokerError> {
        self.record(Call::Unbind(request.clone()));
        self.scripts.lock().unwrap().unbind.next()
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        self.record(Call::PollBinding(request.clone()));
        self.scripts.lock().unwrap().poll_binding.next()
    }

    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, BrokerError> {
        self.record(Call::GetBinding(request.clone()));
        self.scripts.lock().unwrap().get_binding.next()
    }
}

/// Hands out the shared fake for every broker and records the resolved configs
#[derive(Debug)]
pub struct FakeBrokerFactory {
    broker: Arc<FakeBrokerClient>,
    pub configs: Mutex<Vec<BrokerClientConfig>>,
}

impl BrokerClientFactory for FakeBrokerFactory {
    fn create(&self, config: &BrokerClientConfig) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        self.configs.lock().unwrap().push(config.clone());
        Ok(Arc::clone(&self.broker) as Arc<dyn BrokerClient>)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        backoff_start_ms: 5,
        backoff_max_ms: 50,
        poll_interval_start_ms: 5,
        poll_interval_max_ms: 20,
        broker_workers: 1,
        catalog_workers: 1,
        instance_workers: 2,
        binding_workers: 2,
        watch_restart_delay_secs: 1,
        cluster_id: "test-cluster".to_string(),
        ..ControllerConfig::default()
    }
}

pub struct Harness {
    pub stores: Stores,
    pub broker: Arc<FakeBrokerClient>,
    pub factory: Arc<FakeBrokerFactory>,
    pub ctx: Arc<Context>,
    controllers: Option<ControllerSet>,
}

impl Harness {
    /// Controllers running with fast backoffs
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    pub fn start_with(configure: impl FnOnce(&mut ControllerConfig)) -> Self {
        let mut config = fast_config();
        configure(&mut config);

        let stores = Stores::in_memory();
        let broker = Arc::new(FakeBrokerClient::default());
        let factory = Arc::new(FakeBrokerFactory {
            broker: Arc::clone(&broker),
            configs: Mutex::new(Vec::new()),
        });
        let clients = Arc::new(BrokerClientManager::new(
            Arc::clone(&factory) as Arc<dyn BrokerClientFactory>,
            Arc::clone(&stores.secrets),
            config.osb_api_version.clone(),
            config.broker_request_timeout(),
        ));
        let ctx = Arc::new(Context::new(stores.clone(), clients, config));
        let controllers = ControllerSet::start(&ctx);
        Self {
            stores,
            broker,
            factory,
            ctx,
            controllers: Some(controllers),
        }
    }

    pub async fn stop(mut self) {
        if let Some(controllers) = self.controllers.take() {
            controllers.shutdown().await;
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new(NAMESPACE, name)
    }

    // ------------------------------------------------------------------------
    // Brokers and catalog
    // ------------------------------------------------------------------------

    pub async fn create_broker(&self, spec: ServiceBrokerSpec) -> ServiceBroker {
        let mut broker = ServiceBroker::new(BROKER_NAME, spec);
        broker.metadata.namespace = Some(NAMESPACE.to_string());
        self.stores.brokers.create(&broker).await.unwrap()
    }

    /// Default broker, waiting until its catalog is materialized
    pub async fn create_ready_broker(&self) -> ServiceBroker {
        self.create_broker(broker_spec()).await;
        self.wait_broker(|b| b.status.as_ref().is_some_and(ConditionedStatus::is_ready))
            .await
    }

    pub async fn broker_record(&self) -> Option<ServiceBroker> {
        self.stores.brokers.get(&Self::key(BROKER_NAME)).await.unwrap()
    }

    pub async fn wait_broker(&self, cond: impl Fn(&ServiceBroker) -> bool) -> ServiceBroker {
        let store = Arc::clone(&self.stores.brokers);
        let key = Self::key(BROKER_NAME);
        wait_for_record("broker", || store.get(&key), cond).await
    }

    pub async fn edit_broker(&self, edit: impl Fn(&mut ServiceBroker)) {
        for _ in 0..50 {
            let mut broker = self.broker_record().await.unwrap();
            edit(&mut broker);
            match self.stores.brokers.update(&broker).await {
                Ok(_) => return,
                Err(e) if e.is_conflict() => tokio::time::sleep(WAIT_STEP).await,
                Err(e) => panic!("failed to edit broker: {e}"),
            }
        }
        panic!("broker kept conflicting");
    }

    pub async fn delete_broker(&self) {
        self.stores
            .brokers
            .delete(&Self::key(BROKER_NAME))
            .await
            .unwrap();
    }

    pub async fn wait_broker_reason(&self, reason: &str) -> ServiceBroker {
        self.wait_broker(|b| {
            b.status
                .as_ref()
                .and_then(ConditionedStatus::ready_reason)
                == Some(reason)
        })
        .await
    }

    pub async fn wait_broker_gone(&self) {
        let store = Arc::clone(&self.stores.brokers);
        let key = Self::key(BROKER_NAME);
        wait_for_absence("broker", || store.get(&key)).await;
    }

    pub async fn classes(&self) -> Vec<ServiceClass> {
        self.stores.classes.list(NAMESPACE).await.unwrap()
    }

    pub async fn plans(&self) -> Vec<ServicePlan> {
        self.stores.plans.list(NAMESPACE).await.unwrap()
    }

    pub async fn plan_by_external_id(&self, external_id: &str) -> Option<ServicePlan> {
        self.plans()
            .await
            .into_iter()
            .find(|p| p.spec.external_id == external_id)
    }

    // ------------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------------

    pub async fn create_instance(&self, name: &str, spec: ServiceInstanceSpec) -> ServiceInstance {
        let mut instance = ServiceInstance::new(name, spec);
        instance.metadata.namespace = Some(NAMESPACE.to_string());
        self.stores.instances.create(&instance).await.unwrap()
    }

    pub async fn instance(&self, name: &str) -> Option<ServiceInstance> {
        self.stores.instances.get(&Self::key(name)).await.unwrap()
    }

    /// Apply a spec edit, retrying on write conflicts with the controllers
    pub async fn edit_instance(&self, name: &str, edit: impl Fn(&mut ServiceInstance)) {
        for _ in 0..50 {
            let mut instance = self.instance(name).await.unwrap();
            edit(&mut instance);
            match self.stores.instances.update(&instance).await {
                Ok(_) => return,
                Err(e) if e.is_conflict() => tokio::time::sleep(WAIT_STEP).await,
                Err(e) => panic!("failed to edit instance {name}: {e}"),
            }
        }
        panic!("instance {name} kept conflicting");
    }

    pub async fn delete_instance(&self, name: &str) {
        self.stores.instances.delete(&Self::key(name)).await.unwrap();
    }

    pub async fn wait_instance(
        &self,
        name: &str,
        cond: impl Fn(&ServiceInstance) -> bool,
    ) -> ServiceInstance {
        let store = Arc::clone(&self.stores.instances);
        let key = Self::key(name);
        wait_for_record(name, || store.get(&key), cond).await
    }

    pub async fn wait_instance_reason(&self, name: &str, reason: &str) -> ServiceInstance {
        self.wait_instance(name, |i| {
            i.status
                .as_ref()
                .and_then(ConditionedStatus::ready_reason)
                == Some(reason)
        })
        .await
    }

    pub async fn wait_instance_ready(&self, name: &str) -> ServiceInstance {
        self.wait_instance(name, |i| {
            i.status.as_ref().is_some_and(ConditionedStatus::is_ready)
        })
        .await
    }

    pub async fn wait_instance_gone(&self, name: &str) {
        let store = Arc::clone(&self.stores.instances);
        let key = Self::key(name);
        wait_for_absence(name, || store.get(&key)).await;
    }

    // ------------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------------

    pub async fn create_binding(&self, name: &str, spec: ServiceBindingSpec) -> ServiceBinding {
        let mut binding = ServiceBinding::new(name, spec);
        binding.metadata.namespace = Some(NAMESPACE.to_string());
        self.stores.bindings.create(&binding).await.unwrap()
    }

    pub async fn binding(&self, name: &str) -> Option<ServiceBinding> {
        self.stores.bindings.get(&Self::key(name)).await.unwrap()
    }

    pub async fn edit_binding(&self, name: &str, edit: impl Fn(&mut ServiceBinding)) {
        for _ in 0..50 {
            let mut binding = self.binding(name).await.unwrap();
            edit(&mut binding);
            match self.stores.bindings.update(&binding).await {
                Ok(_) => return,
                Err(e) if e.is_conflict() => tokio::time::sleep(WAIT_STEP).await,
                Err(e) => panic!("failed to edit binding {name}: {e}"),
            }
        }
        panic!("binding {name} kept conflicting");
    }

    /// Keep the record around after the controller releases it, so its final
    /// status can be inspected
    pub async fn hold_binding(&self, name: &str) {
        self.edit_binding(name, |b| {
            let finalizers = b.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == HOLD_FINALIZER) {
                finalizers.push(HOLD_FINALIZER.to_string());
            }
        })
        .await;
    }

    pub async fn delete_binding(&self, name: &str) {
        self.stores.bindings.delete(&Self::key(name)).await.unwrap();
    }

    pub async fn wait_binding(
        &self,
        name: &str,
        cond: impl Fn(&ServiceBinding) -> bool,
    ) -> ServiceBinding {
        let store = Arc::clone(&self.stores.bindings);
        let key = Self::key(name);
        wait_for_record(name, || store.get(&key), cond).await
    }

    pub async fn wait_binding_reason(&self, name: &str, reason: &str) -> ServiceBinding {
        self.wait_binding(name, |b| {
            b.status
                .as_ref()
                .and_then(ConditionedStatus::ready_reason)
                == Some(reason)
        })
        .await
    }

    pub async fn wait_binding_ready(&self, name: &str) -> ServiceBinding {
        self.wait_binding(name, |b| {
            b.status.as_ref().is_some_and(ConditionedStatus::is_ready)
        })
        .await
    }

    pub async fn wait_binding_gone(&self, name: &str) {
        let store = Arc::clone(&self.stores.bindings);
        let key = Self::key(name);
        wait_for_absence(name, || store.get(&key)).await;
    }

    // ------------------------------------------------------------------------
    // Secrets
    // ------------------------------------------------------------------------

    pub async fn create_secret(&self, secret: &Secret) {
        self.stores.secrets.create(secret).await.unwrap();
    }

    pub async fn secret(&self, name: &str) -> Option<Secret> {
        self.stores.secrets.get(&Self::key(name)).await.unwrap()
    }

    /// Instance and binding both Ready, on the default broker and plan
    pub async fn bound(&self, instance: &str, binding: &str) -> ServiceBinding {
        self.create_ready_broker().await;
        self.create_instance(instance, instance_spec(PLAN_EXTERNAL_NAME))
            .await;
        self.wait_instance_ready(instance).await;
        self.create_binding(binding, binding_spec(instance)).await;
        self.wait_binding_ready(binding).await
    }
}

async fn wait_for_record<K, F, Fut>(label: &str, fetch: F, cond: impl Fn(&K) -> bool) -> K
where
    K: std::fmt::Debug,
    F: Fn() -> Fut,
    Fut: std::future::Future<
        Output = Result<Option<K>, service_catalog_controller::store::StoreError>,
    >,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    let mut last = None;
    loop {
        if let Some(record) = fetch().await.unwrap() {
            if cond(&record) {
                return record;
            }
            last = Some(record);
        }
        if tokio::time::Instant::now() > deadline {
            panic!("{label} never reached the expected state; last seen: {last:#?}");
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
}

async fn wait_for_absence<K, F, Fut>(label: &str, fetch: F)
where
    K: std::fmt::Debug,
    F: Fn() -> Fut,
    Fut: std::future::Future<
        Output = Result<Option<K>, service_catalog_controller::store::StoreError>,
    >,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let current = fetch().await.unwrap();
        let Some(record) = current else {
            return;
        };
        if tokio::time::Instant::now() > deadline {
            panic!("{label} was never removed; last seen: {record:#?}");
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
}

/// Let the controllers run for a while; used to show that nothing more happens
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

pub fn parameters(value: Value) -> Option<Value> {
    Some(value)
}
