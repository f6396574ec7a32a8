//! # ServiceBinding
//!
//! Credentials for a ServiceInstance, materialized as a Kubernetes secret.

use crate::crd::{Condition, LocalObjectReference, ParametersFromSource, UserInfo};
use serde::{Deserialize, Serialize};

/// ServiceBinding Custom Resource Definition
///
/// Bindings are immutable once created; only deletion triggers further broker calls.
///
/// # Example
///
/// ```yaml
/// apiVersion: servicecatalog.octopilot.io/v1beta1
/// kind: ServiceBinding
/// metadata:
///   name: my-database-credentials
///   namespace: default
/// spec:
///   instanceRef:
///     name: my-database
///   secretName: my-database-credentials
///   secretTransforms:
///     - renameKey:
///         from: uri
///         to: DATABASE_URL
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceBinding",
    group = "servicecatalog.octopilot.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::ServiceBindingStatus",
    shortname = "sbd",
    printcolumn = r#"{"name":"Instance", "type":"string", "jsonPath":".spec.instanceRef.name"}, {"name":"Secret", "type":"string", "jsonPath":".spec.secretName"}, {"name":"Status", "type":"string", "jsonPath":".status.lastConditionState"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    pub instance_ref: LocalObjectReference,
    /// Correlation identifier sent to the broker; assigned once and never changed
    #[serde(rename = "externalID", default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::crd::common::preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Secret receiving the credentials; defaults to the binding name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// Applied in order to the broker credentials before they are written
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_transforms: Vec<SecretTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// One credential-shaping operation; exactly one field should be set
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTransform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_key: Option<AddKeyTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename_key: Option<RenameKeyTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_keys_from: Option<AddKeysFromTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_key: Option<RemoveKeyTransform>,
}

/// Adds a key whose value is a literal or is extracted from the credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyTransform {
    pub key: String,
    /// Base64-encoded bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    /// Structured path evaluated against the credentials, e.g. `{.db.host}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path_expression: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RenameKeyTransform {
    pub from: String,
    pub to: String,
}

/// Merges every key of another secret, later keys winning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddKeysFromTransform {
    pub secret_ref: crate::crd::SecretReference,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoveKeyTransform {
    pub key: String,
}

/// Broker operation a binding is currently driving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum BindingOperation {
    Bind,
    Unbind,
}

/// Progress of broker-side cleanup for a binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum UnbindStatus {
    /// No bind call was ever sent
    #[default]
    NotRequired,
    Required,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingProperties {
    #[serde(default)]
    pub parameters_checksum: Option<String>,
}

/// Status of the ServiceBinding resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub async_op_in_progress: bool,
    #[serde(default)]
    pub last_operation: Option<String>,
    #[serde(default)]
    pub current_operation: Option<BindingOperation>,
    /// Set while a corrective unbind runs after an ambiguous bind
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    #[serde(default)]
    pub unbind_status: UnbindStatus,
    #[serde(default)]
    pub external_properties: Option<BindingProperties>,
    /// Printer column: type of the last condition if true, otherwise its reason
    #[serde(default)]
    pub last_condition_state: Option<String>,
    #[serde(default)]
    pub operation_start_time: Option<String>,
}
