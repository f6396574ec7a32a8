//! # Watch Loop
//!
//! Feeds store watch events into the per-kind work queues and runs one
//! [`Dispatcher`] per kind.
//!
//! Own-key enqueues for brokers, instances and bindings pass through a
//! [`GenerationFilter`]: a status-only write does not requeue the key, so
//! reconcilers that write status on every pass do not spin. Polling relies on
//! `RequeueAfter` timers instead.
//!
//! Cross-kind enqueues:
//!
//! | Event | Enqueues |
//! |---|---|
//! | Secret changed | brokers whose auth references it |
//! | Instance readiness changed or deleted | bindings referencing it |
//! | Instance deleted | its class and plan (removed-entry cleanup) |
//! | Binding deleted | its instance (blocked deprovision) |

use crate::config::ControllerConfig;
use crate::controller::binding::{self, BindingReconciler};
use crate::controller::broker::{self, BrokerReconciler};
use crate::controller::class_plan::{CatalogEntry, CatalogEntryReconciler};
use crate::controller::dispatcher::{Dispatcher, Reconcile};
use crate::controller::instance::{self, InstanceReconciler};
use crate::controller::queue::WorkQueue;
use crate::controller::status::ConditionedStatus;
use crate::controller::{Context, TriggerSource};
use crate::crd::{ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan};
use crate::store::{is_deleting, ObjectKey, SharedStore, StoredResource, WatchEvent};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

/// One work queue per reconciled kind
#[derive(Debug, Clone)]
pub struct Queues {
    pub brokers: Arc<WorkQueue>,
    pub classes: Arc<WorkQueue>,
    pub plans: Arc<WorkQueue>,
    pub instances: Arc<WorkQueue>,
    pub bindings: Arc<WorkQueue>,
}

impl Queues {
    #[must_use]
    pub fn new(config: &ControllerConfig) -> Self {
        let start = config.backoff_start_duration();
        let max = config.backoff_max_duration();
        Self {
            brokers: WorkQueue::new(broker::KIND, start, max),
            classes: WorkQueue::new(<ServiceClass as CatalogEntry>::KIND, start, max),
            plans: WorkQueue::new(<ServicePlan as CatalogEntry>::KIND, start, max),
            instances: WorkQueue::new(instance::KIND, start, max),
            bindings: WorkQueue::new(binding::KIND, start, max),
        }
    }

    fn all(&self) -> [&Arc<WorkQueue>; 5] {
        [
            &self.brokers,
            &self.classes,
            &self.plans,
            &self.instances,
            &self.bindings,
        ]
    }

    pub fn shutdown(&self) {
        for queue in self.all() {
            queue.shutdown();
        }
    }
}

/// Admits events that change a record's generation or deletion state
#[derive(Debug, Default)]
pub struct GenerationFilter {
    seen: HashMap<ObjectKey, (Option<i64>, bool)>,
}

impl GenerationFilter {
    pub fn admits<K: StoredResource>(&mut self, event: &WatchEvent<K>) -> bool {
        match event {
            WatchEvent::Applied(obj) => {
                let state = (obj.meta().generation, is_deleting(obj));
                self.seen.insert(ObjectKey::of(obj), state) != Some(state)
            }
            WatchEvent::Deleted(obj) => {
                self.seen.remove(&ObjectKey::of(obj));
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

/// Reacts to the events of one kind
#[async_trait]
trait WatchHandler<K: StoredResource>: Send + 'static {
    async fn handle(&mut self, event: &WatchEvent<K>);

    /// Called before a watch restarts and replays the store contents
    fn reset(&mut self) {}
}

fn enqueue(queue: &WorkQueue, key: ObjectKey) {
    debug!(
        resource.kind = queue.kind(),
        resource.key = %key,
        trigger = TriggerSource::WatchEvent.as_str(),
        "enqueue"
    );
    queue.add(key);
}

/// Own-key enqueue behind a generation filter
struct OwnKey {
    queue: Arc<WorkQueue>,
    filter: GenerationFilter,
}

impl OwnKey {
    fn new(queue: &Arc<WorkQueue>) -> Self {
        Self {
            queue: Arc::clone(queue),
            filter: GenerationFilter::default(),
        }
    }

    fn observe<K: StoredResource>(&mut self, event: &WatchEvent<K>) {
        if self.filter.admits(event) {
            enqueue(&self.queue, ObjectKey::of(event.object()));
        }
    }
}

struct BrokerEvents(OwnKey);

#[async_trait]
impl WatchHandler<ServiceBroker> for BrokerEvents {
    async fn handle(&mut self, event: &WatchEvent<ServiceBroker>) {
        self.0.observe(event);
    }

    fn reset(&mut self) {
        self.0.filter.clear();
    }
}

/// Classes and plans: every event, their reconcile never writes
struct CatalogEntryEvents {
    queue: Arc<WorkQueue>,
}

#[async_trait]
impl<K: StoredResource> WatchHandler<K> for CatalogEntryEvents {
    async fn handle(&mut self, event: &WatchEvent<K>) {
        enqueue(&self.queue, ObjectKey::of(event.object()));
    }
}

struct InstanceEvents {
    own: OwnKey,
    bindings_store: SharedStore<ServiceBinding>,
    bindings: Arc<WorkQueue>,
    classes: Arc<WorkQueue>,
    plans: Arc<WorkQueue>,
    // Last readiness seen per instance; bindings only care about flips
    ready: HashMap<ObjectKey, bool>,
}

impl InstanceEvents {
    async fn enqueue_bindings(&self, instance: &ServiceInstance) {
        let namespace = instance.namespace().unwrap_or_else(|| "default".to_string());
        let name = instance.name_any();
        match self.bindings_store.list(&namespace).await {
            Ok(bindings) => {
                for binding in bindings
                    .iter()
                    .filter(|b| b.spec.instance_ref.name == name)
                {
                    enqueue(&self.bindings, ObjectKey::of(binding));
                }
            }
            Err(e) => warn!(instance = %name, "failed to list bindings of instance: {}", e),
        }
    }
}

#[async_trait]
impl WatchHandler<ServiceInstance> for InstanceEvents {
    async fn handle(&mut self, event: &WatchEvent<ServiceInstance>) {
        self.own.observe(event);
        let instance = event.object();
        let key = ObjectKey::of(instance);
        match event {
            WatchEvent::Applied(_) => {
                let ready = instance
                    .status
                    .as_ref()
                    .is_some_and(ConditionedStatus::is_ready);
                if self.ready.insert(key, ready) != Some(ready) {
                    self.enqueue_bindings(instance).await;
                }
            }
            WatchEvent::Deleted(_) => {
                self.ready.remove(&key);
                self.enqueue_bindings(instance).await;
                if let Some(status) = instance.status.as_ref() {
                    if let Some(class) = status.service_class_ref.as_deref() {
                        enqueue(&self.classes, ObjectKey::new(&key.namespace, class));
                    }
                    if let Some(plan) = status.service_plan_ref.as_deref() {
                        enqueue(&self.plans, ObjectKey::new(&key.namespace, plan));
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.own.filter.clear();
        self.ready.clear();
    }
}

struct BindingEvents {
    own: OwnKey,
    instances: Arc<WorkQueue>,
}

#[async_trait]
impl WatchHandler<ServiceBinding> for BindingEvents {
    async fn handle(&mut self, event: &WatchEvent<ServiceBinding>) {
        self.own.observe(event);
        if let WatchEvent::Deleted(binding) = event {
            let namespace = binding.namespace().unwrap_or_else(|| "default".to_string());
            enqueue(
                &self.instances,
                ObjectKey::new(namespace, &binding.spec.instance_ref.name),
            );
        }
    }

    fn reset(&mut self) {
        self.own.filter.clear();
    }
}

/// Broker auth secrets; only brokers in the secret's namespace are considered
struct SecretEvents {
    brokers_store: SharedStore<ServiceBroker>,
    brokers: Arc<WorkQueue>,
}

#[async_trait]
impl WatchHandler<Secret> for SecretEvents {
    async fn handle(&mut self, event: &WatchEvent<Secret>) {
        let secret = event.object();
        let namespace = secret.namespace().unwrap_or_else(|| "default".to_string());
        let name = secret.name_any();
        let brokers = match self.brokers_store.list(&namespace).await {
            Ok(brokers) => brokers,
            Err(e) => {
                warn!(secret = %name, "failed to list brokers: {}", e);
                return;
            }
        };
        for broker in &brokers {
            let references = broker
                .spec
                .auth_info
                .as_ref()
                .and_then(|auth| auth.secret_ref())
                .is_some_and(|r| {
                    r.name == name && r.namespace.as_deref().unwrap_or(&namespace) == namespace
                });
            if references {
                enqueue(&self.brokers, ObjectKey::of(broker));
            }
        }
    }
}

fn spawn_watch<K, H>(
    set: &mut JoinSet<()>,
    kind: &'static str,
    store: SharedStore<K>,
    mut handler: H,
    restart_delay: Duration,
) where
    K: StoredResource,
    H: WatchHandler<K>,
{
    let span = tracing::span!(tracing::Level::INFO, "controller.watch", resource.kind = kind);
    set.spawn(
        async move {
            loop {
                let mut events = store.watch();
                while let Some(event) = events.next().await {
                    handler.handle(&event).await;
                }
                warn!(
                    "watch stream ended, restarting in {}s",
                    restart_delay.as_secs()
                );
                tokio::time::sleep(restart_delay).await;
                handler.reset();
            }
        }
        .instrument(span),
    );
}

/// Running watches and worker pools
#[derive(Debug)]
pub struct ControllerSet {
    queues: Queues,
    watches: JoinSet<()>,
    dispatchers: JoinSet<()>,
}

impl ControllerSet {
    /// Start watching every kind and reconciling with the configured worker counts
    #[must_use]
    pub fn start(ctx: &Arc<Context>) -> Self {
        let config = &ctx.config;
        let queues = Queues::new(config);
        let stores = &ctx.stores;
        let restart_delay = config.watch_restart_delay_duration();

        let mut watches = JoinSet::new();
        spawn_watch(
            &mut watches,
            broker::KIND,
            Arc::clone(&stores.brokers),
            BrokerEvents(OwnKey::new(&queues.brokers)),
            restart_delay,
        );
        spawn_watch(
            &mut watches,
            <ServiceClass as CatalogEntry>::KIND,
            Arc::clone(&stores.classes),
            CatalogEntryEvents {
                queue: Arc::clone(&queues.classes),
            },
            restart_delay,
        );
        spawn_watch(
            &mut watches,
            <ServicePlan as CatalogEntry>::KIND,
            Arc::clone(&stores.plans),
            CatalogEntryEvents {
                queue: Arc::clone(&queues.plans),
            },
            restart_delay,
        );
        spawn_watch(
            &mut watches,
            instance::KIND,
            Arc::clone(&stores.instances),
            InstanceEvents {
                own: OwnKey::new(&queues.instances),
                bindings_store: Arc::clone(&stores.bindings),
                bindings: Arc::clone(&queues.bindings),
                classes: Arc::clone(&queues.classes),
                plans: Arc::clone(&queues.plans),
                ready: HashMap::new(),
            },
            restart_delay,
        );
        spawn_watch(
            &mut watches,
            binding::KIND,
            Arc::clone(&stores.bindings),
            BindingEvents {
                own: OwnKey::new(&queues.bindings),
                instances: Arc::clone(&queues.instances),
            },
            restart_delay,
        );
        spawn_watch(
            &mut watches,
            "secret",
            Arc::clone(&stores.secrets),
            SecretEvents {
                brokers_store: Arc::clone(&stores.brokers),
                brokers: Arc::clone(&queues.brokers),
            },
            restart_delay,
        );

        let pools: [(Arc<WorkQueue>, Arc<dyn Reconcile>, usize); 5] = [
            (
                Arc::clone(&queues.brokers),
                Arc::new(BrokerReconciler::new(Arc::clone(ctx))),
                config.broker_workers,
            ),
            (
                Arc::clone(&queues.classes),
                Arc::new(CatalogEntryReconciler::<ServiceClass>::new(Arc::clone(ctx))),
                config.catalog_workers,
            ),
            (
                Arc::clone(&queues.plans),
                Arc::new(CatalogEntryReconciler::<ServicePlan>::new(Arc::clone(ctx))),
                config.catalog_workers,
            ),
            (
                Arc::clone(&queues.instances),
                Arc::new(InstanceReconciler::new(Arc::clone(ctx))),
                config.instance_workers,
            ),
            (
                Arc::clone(&queues.bindings),
                Arc::new(BindingReconciler::new(Arc::clone(ctx))),
                config.binding_workers,
            ),
        ];
        let mut dispatchers = JoinSet::new();
        for (queue, reconciler, workers) in pools {
            dispatchers.spawn(Dispatcher::new(queue, reconciler).run(workers));
        }
        info!(
            broker_workers = config.broker_workers,
            catalog_workers = config.catalog_workers,
            instance_workers = config.instance_workers,
            binding_workers = config.binding_workers,
            "controllers started"
        );

        Self {
            queues,
            watches,
            dispatchers,
        }
    }

    #[must_use]
    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    /// Stop watching, let in-flight reconciles finish and wait for the workers
    pub async fn shutdown(mut self) {
        self.watches.abort_all();
        self.queues.shutdown();
        while self.dispatchers.join_next().await.is_some() {}
        while self.watches.join_next().await.is_some() {}
        info!("controllers stopped");
    }
}
