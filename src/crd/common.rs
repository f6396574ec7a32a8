//! # Shared CRD Types
//!
//! Conditions, object references and schema helpers used by every kind.

use schemars::{Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};

/// Condition status value for a satisfied condition
pub const CONDITION_TRUE: &str = "True";
/// Condition status value for an unsatisfied condition
pub const CONDITION_FALSE: &str = "False";

/// Condition represents a condition of a resource
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Ready, Failed)
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the status flipped (RFC3339)
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    /// Whether the condition status is `True`
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.status == CONDITION_TRUE
    }
}

/// Reference to a secret, defaulting to the namespace of the referencing object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A single key of a secret in the referencing object's namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

/// Source of a parameters fragment
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParametersFromSource {
    /// Secret key whose value is a JSON object merged into the parameters
    #[serde(default)]
    pub secret_key_ref: Option<SecretKeyReference>,
}

/// Reference to an object in the same namespace
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
}

/// Identity of the user that last changed the spec
///
/// Forwarded to brokers in the originating identity header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// Schema for opaque documents (parameters, broker metadata)
///
/// Structural schemas reject free-form objects unless unknown fields are preserved.
pub(crate) fn preserve_unknown_fields(_gen: &mut SchemaGenerator) -> Schema {
    let schema_value = serde_json::json!({
        "type": "object",
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true
    });
    Schema::try_from(schema_value).unwrap_or_else(|_| Schema::from(true))
}
