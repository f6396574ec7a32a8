//! # Catalog Records
//!
//! ServiceClass and ServicePlan records are written by the catalog synchronizer,
//! never by users.

use serde::{Deserialize, Serialize};

/// A service offered by a broker
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceClass",
    group = "servicecatalog.octopilot.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::ServiceCatalogEntryStatus",
    shortname = "sc",
    printcolumn = r#"{"name":"External-Name", "type":"string", "jsonPath":".spec.externalName"}, {"name":"Broker", "type":"string", "jsonPath":".spec.brokerName"}, {"name":"Removed", "type":"boolean", "jsonPath":".status.removedFromBrokerCatalog"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceClassSpec {
    pub broker_name: String,
    /// Identifier assigned by the broker
    #[serde(rename = "externalID")]
    pub external_id: String,
    pub external_name: String,
    #[serde(default)]
    pub description: String,
    /// Default bindability for plans of this class
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updatable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::crd::common::preserve_unknown_fields")]
    pub external_metadata: Option<serde_json::Value>,
}

/// A plan of a service class
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServicePlan",
    group = "servicecatalog.octopilot.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::ServiceCatalogEntryStatus",
    shortname = "sp",
    printcolumn = r#"{"name":"External-Name", "type":"string", "jsonPath":".spec.externalName"}, {"name":"Class", "type":"string", "jsonPath":".spec.serviceClassRef"}, {"name":"Free", "type":"boolean", "jsonPath":".spec.free"}, {"name":"Removed", "type":"boolean", "jsonPath":".status.removedFromBrokerCatalog"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServicePlanSpec {
    pub broker_name: String,
    /// Internal name of the owning ServiceClass
    pub service_class_ref: String,
    #[serde(rename = "externalID")]
    pub external_id: String,
    pub external_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub free: bool,
    /// Overrides the class default when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::crd::common::preserve_unknown_fields")]
    pub external_metadata: Option<serde_json::Value>,
}

/// Status shared by classes and plans
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCatalogEntryStatus {
    /// Set when the broker stopped advertising the entry; the record is kept
    /// while instances still reference it
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
}

impl ServiceClass {
    /// Whether the last catalog sync dropped this class
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    }
}

impl ServicePlan {
    /// Whether the last catalog sync dropped this plan
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    }

    /// Effective bindability: the plan flag wins over the class default
    #[must_use]
    pub fn is_bindable(&self, class: &ServiceClass) -> bool {
        self.spec.bindable.unwrap_or(class.spec.bindable)
    }
}
