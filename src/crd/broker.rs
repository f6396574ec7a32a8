//! # ServiceBroker
//!
//! A broker endpoint and the policy used to refresh its catalog.

use crate::crd::{Condition, SecretReference};
use serde::{Deserialize, Serialize};

/// ServiceBroker Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: servicecatalog.octopilot.io/v1beta1
/// kind: ServiceBroker
/// metadata:
///   name: ups-broker
///   namespace: default
/// spec:
///   url: http://ups-broker.brokers.svc.cluster.local
///   authInfo:
///     basic:
///       secretRef:
///         name: ups-broker-auth
///   relistBehavior: Duration
///   relistDuration: 15m
///   catalogRestrictions:
///     servicePlan:
///       - "spec.free=true"
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceBroker",
    group = "servicecatalog.octopilot.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::ServiceBrokerStatus",
    shortname = "sb",
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.url"}, {"name":"Status", "type":"string", "jsonPath":".status.lastConditionState"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerSpec {
    /// Base URL of the broker's OSB API
    pub url: String,
    /// PEM bundle (base64) trusted when connecting to the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// Credentials presented to the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<AuthInfo>,
    /// When the catalog is fetched again after the first successful sync
    #[serde(default)]
    pub relist_behavior: RelistBehavior,
    /// Interval between relists for the `Duration` behavior
    /// Format: Kubernetes duration string (e.g., "30s", "15m", "1h")
    #[serde(default = "default_relist_duration")]
    pub relist_duration: String,
    /// Manual relist trigger; incrementing it forces a catalog fetch
    #[serde(default)]
    pub relist_requests: i64,
    /// Filters applied to the catalog before classes and plans are materialized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_restrictions: Option<CatalogRestrictions>,
}

fn default_relist_duration() -> String {
    crate::constants::DEFAULT_RELIST_DURATION.to_string()
}

/// Relist policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum RelistBehavior {
    /// Only relist on spec changes and manual requests
    Never,
    /// Relist on every reconcile
    Always,
    /// Relist once `relistDuration` has elapsed since the last sync
    #[default]
    Duration,
}

/// Broker credentials; at most one variant should be set
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicAuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<BearerTokenAuthConfig>,
}

impl AuthInfo {
    /// Secret backing whichever auth mode is configured
    #[must_use]
    pub fn secret_ref(&self) -> Option<&SecretReference> {
        self.basic
            .as_ref()
            .map(|b| &b.secret_ref)
            .or_else(|| self.bearer.as_ref().map(|b| &b.secret_ref))
    }
}

/// Basic auth read from the `username` and `password` keys of a secret
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthConfig {
    pub secret_ref: SecretReference,
}

/// Bearer token read from the `token` key of a secret
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BearerTokenAuthConfig {
    pub secret_ref: SecretReference,
}

/// Label-selector style predicates over catalog entries
///
/// Every predicate must match for an entry to be materialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRestrictions {
    #[serde(default)]
    pub service_class: Vec<String>,
    #[serde(default)]
    pub service_plan: Vec<String>,
}

/// Status of the ServiceBroker resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBrokerStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Generation whose spec produced the last successful catalog sync
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Time of the last successful catalog fetch (RFC3339)
    #[serde(default)]
    pub last_catalog_retrieval_time: Option<String>,
    /// `spec.relistRequests` value seen by the last successful sync
    #[serde(default)]
    pub last_observed_relist_requests: Option<i64>,
    /// Printer column: type of the last condition if true, otherwise its reason
    #[serde(default)]
    pub last_condition_state: Option<String>,
}
