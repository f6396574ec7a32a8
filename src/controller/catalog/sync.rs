//! # Catalog Sync
//!
//! Materializes a broker's catalog as ServiceClass and ServicePlan records.

use super::restrictions::{
    Restriction, KEY_EXTERNAL_ID, KEY_EXTERNAL_NAME, KEY_FREE, KEY_NAME, KEY_SERVICE_CLASS_NAME,
};
use crate::broker::{BrokerClient, BrokerError, CatalogResponse, Plan, Service};
use crate::crd::{
    ServiceBroker, ServiceCatalogEntryStatus, ServiceClass, ServiceClassSpec, ServicePlan,
    ServicePlanSpec,
};
use crate::store::{ObjectKey, StoreError, Stores};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};

/// The broker's catalog endpoint failed; existing records are left untouched
#[derive(Debug, Error)]
#[error("failed to fetch catalog from broker {broker}: {source}")]
pub struct CatalogFetchError {
    pub broker: String,
    pub source: BrokerError,
}

/// Restrictions of one broker, parsed once per sync
#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub classes: Restriction,
    pub plans: Restriction,
}

/// Counts reported after a sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub classes: usize,
    pub plans: usize,
    pub removed_classes: usize,
    pub removed_plans: usize,
}

/// Fetch the catalog of a broker
///
/// # Errors
///
/// Returns [`CatalogFetchError`] when the broker call fails.
pub async fn fetch_catalog(
    client: &dyn BrokerClient,
    broker: &ServiceBroker,
) -> Result<CatalogResponse, CatalogFetchError> {
    client
        .get_catalog()
        .await
        .map_err(|source| CatalogFetchError {
            broker: ObjectKey::of(broker).to_string(),
            source,
        })
}

/// Create, update and mark removed the class and plan records of a broker
///
/// # Errors
///
/// Returns [`StoreError`] when a record cannot be read or written.
pub async fn apply_catalog(
    stores: &Stores,
    broker: &ServiceBroker,
    catalog: &CatalogResponse,
    filter: &CatalogFilter,
) -> Result<SyncSummary, StoreError> {
    let namespace = broker.namespace().unwrap_or_else(|| "default".to_string());
    let broker_name = broker.name_any();

    let existing_classes: Vec<ServiceClass> = stores
        .classes
        .list(&namespace)
        .await?
        .into_iter()
        .filter(|c| c.spec.broker_name == broker_name)
        .collect();
    let existing_plans: Vec<ServicePlan> = stores
        .plans
        .list(&namespace)
        .await?
        .into_iter()
        .filter(|p| p.spec.broker_name == broker_name)
        .collect();

    let mut summary = SyncSummary::default();
    let mut kept_classes = HashSet::new();
    let mut kept_plans = HashSet::new();

    for service in &catalog.services {
        let existing = existing_classes
            .iter()
            .find(|c| c.spec.external_id == service.id);
        let class_name = match existing {
            Some(class) => class.name_any(),
            None => {
                let taken: HashSet<String> = existing_classes.iter().map(ResourceExt::name_any).collect();
                available_name(stores, &namespace, &service.id, &taken, true).await?
            }
        };

        if !filter.classes.matches(&class_properties(&class_name, service)) {
            debug!(broker.name = %broker_name, service = %service.name, "class excluded by catalog restrictions");
            continue;
        }

        let spec = class_spec(&broker_name, service);
        upsert_class(stores, &namespace, &class_name, existing, spec).await?;
        kept_classes.insert(service.id.clone());
        summary.classes += 1;

        for plan in &service.plans {
            let existing = existing_plans.iter().find(|p| p.spec.external_id == plan.id);
            let plan_name = match existing {
                Some(p) => p.name_any(),
                None => {
                    let taken: HashSet<String> =
                        existing_plans.iter().map(ResourceExt::name_any).collect();
                    available_name(stores, &namespace, &plan.id, &taken, false).await?
                }
            };
            if !filter
                .plans
                .matches(&plan_properties(&plan_name, &class_name, plan))
            {
                debug!(broker.name = %broker_name, plan = %plan.name, "plan excluded by catalog restrictions");
                continue;
            }
            let spec = plan_spec(&broker_name, &class_name, plan);
            upsert_plan(stores, &namespace, &plan_name, existing, spec).await?;
            kept_plans.insert(plan.id.clone());
            summary.plans += 1;
        }
    }

    for class in &existing_classes {
        if !kept_classes.contains(&class.spec.external_id) && !class.is_removed() {
            let mut removed = class.clone();
            removed.status = Some(ServiceCatalogEntryStatus {
                removed_from_broker_catalog: true,
            });
            stores.classes.update_status(&removed).await?;
            info!(broker.name = %broker_name, class = %class.name_any(), "class removed from broker catalog");
            summary.removed_classes += 1;
        }
    }
    for plan in &existing_plans {
        if !kept_plans.contains(&plan.spec.external_id) && !plan.is_removed() {
            let mut removed = plan.clone();
            removed.status = Some(ServiceCatalogEntryStatus {
                removed_from_broker_catalog: true,
            });
            stores.plans.update_status(&removed).await?;
            info!(broker.name = %broker_name, plan = %plan.name_any(), "plan removed from broker catalog");
            summary.removed_plans += 1;
        }
    }

    Ok(summary)
}

fn class_properties<'a>(name: &str, service: &Service) -> HashMap<&'a str, String> {
    HashMap::from([
        (KEY_NAME, name.to_string()),
        (KEY_EXTERNAL_NAME, service.name.clone()),
        (KEY_EXTERNAL_ID, service.id.clone()),
    ])
}

fn plan_properties<'a>(name: &str, class_name: &str, plan: &Plan) -> HashMap<&'a str, String> {
    HashMap::from([
        (KEY_NAME, name.to_string()),
        (KEY_EXTERNAL_NAME, plan.name.clone()),
        (KEY_EXTERNAL_ID, plan.id.clone()),
        (KEY_FREE, plan.free.unwrap_or(true).to_string()),
        (KEY_SERVICE_CLASS_NAME, class_name.to_string()),
    ])
}

fn class_spec(broker_name: &str, service: &Service) -> ServiceClassSpec {
    ServiceClassSpec {
        broker_name: broker_name.to_string(),
        external_id: service.id.clone(),
        external_name: service.name.clone(),
        description: service.description.clone(),
        bindable: service.bindable,
        plan_updatable: service.plan_updateable.unwrap_or(false),
        tags: service.tags.clone(),
        external_metadata: service.metadata.clone(),
    }
}

fn plan_spec(broker_name: &str, class_name: &str, plan: &Plan) -> ServicePlanSpec {
    ServicePlanSpec {
        broker_name: broker_name.to_string(),
        service_class_ref: class_name.to_string(),
        external_id: plan.id.clone(),
        external_name: plan.name.clone(),
        description: plan.description.clone(),
        free: plan.free.unwrap_or(true),
        bindable: plan.bindable,
        external_metadata: plan.metadata.clone(),
    }
}

fn same<T: Serialize>(a: &T, b: &T) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

async fn upsert_class(
    stores: &Stores,
    namespace: &str,
    name: &str,
    existing: Option<&ServiceClass>,
    spec: ServiceClassSpec,
) -> Result<(), StoreError> {
    let Some(existing) = existing else {
        let mut class = ServiceClass::new(name, spec);
        class.metadata.namespace = Some(namespace.to_string());
        stores.classes.create(&class).await?;
        info!(class = %name, "created service class");
        return Ok(());
    };

    let mut current = existing.clone();
    if !same(&current.spec, &spec) {
        current.spec = spec;
        current = stores.classes.update(&current).await?;
        debug!(class = %name, "updated service class");
    }
    if current.is_removed() {
        current.status = Some(ServiceCatalogEntryStatus::default());
        stores.classes.update_status(&current).await?;
        info!(class = %name, "service class is back in the broker catalog");
    }
    Ok(())
}

async fn upsert_plan(
    stores: &Stores,
    namespace: &str,
    name: &str,
    existing: Option<&ServicePlan>,
    spec: ServicePlanSpec,
) -> Result<(), StoreError> {
    let Some(existing) = existing else {
        let mut plan = ServicePlan::new(name, spec);
        plan.metadata.namespace = Some(namespace.to_string());
        stores.plans.create(&plan).await?;
        info!(plan = %name, "created service plan");
        return Ok(());
    };

    let mut current = existing.clone();
    if !same(&current.spec, &spec) {
        current.spec = spec;
        current = stores.plans.update(&current).await?;
        debug!(plan = %name, "updated service plan");
    }
    if current.is_removed() {
        current.status = Some(ServiceCatalogEntryStatus::default());
        stores.plans.update_status(&current).await?;
        info!(plan = %name, "service plan is back in the broker catalog");
    }
    Ok(())
}

/// Lowercase DNS-style name derived from a broker-assigned identifier
#[must_use]
pub fn sanitize_name(external_id: &str) -> String {
    let sanitized: String = external_id
        .to_lowercase()
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '-' || c == '.' => c,
            _ => '-',
        })
        .collect();

    // Collapse runs of dashes left behind by replaced characters
    let mut result = String::with_capacity(sanitized.len());
    let mut prev_was_dash = false;
    for c in sanitized.chars() {
        if c == '-' {
            if !prev_was_dash {
                result.push(c);
            }
            prev_was_dash = true;
        } else {
            result.push(c);
            prev_was_dash = false;
        }
    }

    let trimmed: String = result.trim_matches(|c| c == '-' || c == '.').chars().take(253).collect();
    trimmed
}

/// Internal name for a new record; falls back to a suffixed name when another
/// broker already owns the derived one
async fn available_name(
    stores: &Stores,
    namespace: &str,
    external_id: &str,
    taken_by_broker: &HashSet<String>,
    class: bool,
) -> Result<String, StoreError> {
    let base = sanitize_name(external_id);
    let base = if base.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        base
    };

    let exists = |name: String| async move {
        let key = ObjectKey::new(namespace, name);
        if class {
            stores.classes.get(&key).await.map(|c| c.is_some())
        } else {
            stores.plans.get(&key).await.map(|p| p.is_some())
        }
    };

    if !taken_by_broker.contains(&base) && !exists(base.clone()).await? {
        return Ok(base);
    }
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let mut name: String = base.chars().take(244).collect();
    name.push('-');
    name.push_str(&suffix[..8]);
    Ok(name)
}
