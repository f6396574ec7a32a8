//! # ServiceInstance
//!
//! A service provisioned through a broker.

use crate::crd::{Condition, ParametersFromSource, UserInfo};
use serde::{Deserialize, Serialize};

/// ServiceInstance Custom Resource Definition
///
/// The class and plan are referenced either by their external (broker) names
/// or by the internal names of the ServiceClass / ServicePlan records.
///
/// # Example
///
/// ```yaml
/// apiVersion: servicecatalog.octopilot.io/v1beta1
/// kind: ServiceInstance
/// metadata:
///   name: my-database
///   namespace: default
/// spec:
///   serviceClassExternalName: postgres
///   servicePlanExternalName: small
///   parameters:
///     version: "16"
///   parametersFrom:
///     - secretKeyRef:
///         name: db-settings
///         key: parameters
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceInstance",
    group = "servicecatalog.octopilot.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::ServiceInstanceStatus",
    shortname = "si",
    printcolumn = r#"{"name":"Class", "type":"string", "jsonPath":".status.userSpecifiedClassName"}, {"name":"Plan", "type":"string", "jsonPath":".status.userSpecifiedPlanName"}, {"name":"Status", "type":"string", "jsonPath":".status.lastConditionState"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_external_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_external_name: Option<String>,
    /// Internal name of a ServiceClass record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_class_name: Option<String>,
    /// Internal name of a ServicePlan record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_plan_name: Option<String>,
    /// Correlation identifier sent to the broker; assigned once and never changed
    #[serde(rename = "externalID", default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Inline parameters passed to the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::crd::common::preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    /// Secret-sourced parameter fragments, merged over `parameters` in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Requesting user, forwarded as the originating identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// Broker operation an instance is currently driving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum InstanceOperation {
    Provision,
    Update,
    Deprovision,
}

/// Progress of broker-side cleanup for an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum DeprovisionStatus {
    /// No provision call was ever sent
    #[default]
    NotRequired,
    Required,
    InProgress,
    Succeeded,
    Failed,
}

/// Properties the broker last acknowledged (or is processing)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProperties {
    #[serde(rename = "servicePlanExternalID", default)]
    pub service_plan_external_id: String,
    /// sha256 of the resolved parameters
    #[serde(default)]
    pub parameters_checksum: Option<String>,
}

/// Status of the ServiceInstance resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Generation whose spec was last acted on
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub async_op_in_progress: bool,
    /// Opaque operation token returned by the broker for async operations
    #[serde(default)]
    pub last_operation: Option<String>,
    #[serde(default)]
    pub current_operation: Option<InstanceOperation>,
    /// Set while a corrective deprovision runs after an ambiguous provision
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    #[serde(default)]
    pub deprovision_status: DeprovisionStatus,
    #[serde(default, rename = "dashboardURL")]
    pub dashboard_url: Option<String>,
    /// Whether the broker acknowledged a provision
    #[serde(default)]
    pub provisioned: bool,
    #[serde(default)]
    pub external_properties: Option<InstanceProperties>,
    #[serde(default)]
    pub in_progress_properties: Option<InstanceProperties>,
    /// Internal name of the resolved ServiceClass
    #[serde(default)]
    pub service_class_ref: Option<String>,
    /// Internal name of the resolved ServicePlan
    #[serde(default)]
    pub service_plan_ref: Option<String>,
    #[serde(default)]
    pub user_specified_class_name: Option<String>,
    #[serde(default)]
    pub user_specified_plan_name: Option<String>,
    /// Printer column: type of the last condition if true, otherwise its reason
    #[serde(default)]
    pub last_condition_state: Option<String>,
    /// Start of the current operation (RFC3339)
    #[serde(default)]
    pub operation_start_time: Option<String>,
    /// Generation whose spec started the current operation
    #[serde(default)]
    pub operation_generation: Option<i64>,
}
