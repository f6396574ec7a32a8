//! # Parameter Resolution
//!
//! Builds the parameters document sent to a broker from a record's inline
//! `parameters` and its `parametersFrom` secret fragments.
//!
//! Fragments are applied in listed order with a shallow merge, later keys winning.
//! A missing secret, a missing key, or a value that is not a JSON object is a
//! configuration error: retrying cannot fix it, so callers record a terminal
//! `ErrorWithParameters` failure.

use crate::broker::Parameters;
use crate::crd::ParametersFromSource;
use crate::store::{ObjectKey, ObjectStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParametersError {
    #[error("inline parameters must be a JSON object")]
    InlineNotObject,
    #[error("parametersFrom entry {0} has no secretKeyRef")]
    EmptySource(usize),
    #[error("parameters secret {0} not found")]
    SecretNotFound(String),
    #[error("parameters secret {secret} has no key {key}")]
    MissingKey { secret: String, key: String },
    #[error("parameters secret {secret} key {key} is not a JSON object: {reason}")]
    NotAnObject {
        secret: String,
        key: String,
        reason: String,
    },
    #[error("failed to read parameters secret: {0}")]
    Store(#[from] StoreError),
}

impl ParametersError {
    /// Everything but store read failures needs a user edit to fix
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Parameters ready to send, plus their checksum
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedParameters {
    /// `None` when neither inline parameters nor sources were given
    pub parameters: Option<Parameters>,
    pub checksum: Option<String>,
}

/// Merge inline parameters with secret-sourced fragments
///
/// # Errors
///
/// Returns a terminal [`ParametersError`] for misconfigured sources and
/// [`ParametersError::Store`] when a secret cannot be read.
pub async fn resolve_parameters(
    secrets: &dyn ObjectStore<Secret>,
    namespace: &str,
    inline: Option<&Value>,
    sources: &[ParametersFromSource],
) -> Result<ResolvedParameters, ParametersError> {
    if inline.is_none() && sources.is_empty() {
        return Ok(ResolvedParameters::default());
    }

    let mut merged = match inline {
        None | Some(Value::Null) => Parameters::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(ParametersError::InlineNotObject),
    };

    for (index, source) in sources.iter().enumerate() {
        let reference = source
            .secret_key_ref
            .as_ref()
            .ok_or(ParametersError::EmptySource(index))?;
        let key = ObjectKey::new(namespace, &reference.name);
        let secret = secrets
            .get(&key)
            .await?
            .ok_or_else(|| ParametersError::SecretNotFound(key.to_string()))?;
        let raw = secret_bytes(&secret, &reference.key).ok_or_else(|| {
            ParametersError::MissingKey {
                secret: key.to_string(),
                key: reference.key.clone(),
            }
        })?;
        let fragment = parse_fragment(&raw).map_err(|reason| ParametersError::NotAnObject {
            secret: key.to_string(),
            key: reference.key.clone(),
            reason,
        })?;
        merged.extend(fragment);
    }

    let checksum = parameters_checksum(&merged);
    Ok(ResolvedParameters {
        parameters: Some(merged),
        checksum: Some(checksum),
    })
}

fn parse_fragment(raw: &[u8]) -> Result<Parameters, String> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("got {}", json_type(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Raw value of a secret key, preferring `data` over `stringData`
pub(crate) fn secret_bytes(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    if let Some(bytes) = secret.data.as_ref().and_then(|data| data.get(key)) {
        return Some(bytes.0.clone());
    }
    secret
        .string_data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|s| s.as_bytes().to_vec())
}

/// sha256 (hex) of the canonical JSON encoding of the parameters
#[must_use]
pub fn parameters_checksum(parameters: &Parameters) -> String {
    // Map is key-ordered, so equal documents always encode identically
    let encoded = Value::Object(parameters.clone()).to_string();
    format!("{:x}", Sha256::digest(encoded.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SecretKeyReference;
    use crate::store::MemoryStore;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn store_with(name: &str, key: &str, value: &str) -> MemoryStore<Secret> {
        let store = MemoryStore::new();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                key.to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Secret::default()
        };
        store.create(&secret).await.unwrap();
        store
    }

    fn from_secret(name: &str, key: &str) -> ParametersFromSource {
        ParametersFromSource {
            secret_key_ref: Some(SecretKeyReference {
                name: name.to_string(),
                key: key.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_inline_and_secret_fragments_merge() {
        let store = store_with("param-secret", "parameters", r#"{"A":"B"}"#).await;
        let inline = json!({"Name": "x"});
        let resolved = resolve_parameters(
            &store,
            "default",
            Some(&inline),
            &[from_secret("param-secret", "parameters")],
        )
        .await
        .unwrap();

        assert_eq!(
            Value::Object(resolved.parameters.unwrap()),
            json!({"Name": "x", "A": "B"})
        );
        assert!(resolved.checksum.is_some());
    }

    #[tokio::test]
    async fn test_later_sources_win() {
        let store = store_with("param-secret", "parameters", r#"{"Name":"from-secret"}"#).await;
        let inline = json!({"Name": "inline", "keep": 1});
        let resolved = resolve_parameters(
            &store,
            "default",
            Some(&inline),
            &[from_secret("param-secret", "parameters")],
        )
        .await
        .unwrap();

        assert_eq!(
            Value::Object(resolved.parameters.unwrap()),
            json!({"Name": "from-secret", "keep": 1})
        );
    }

    #[tokio::test]
    async fn test_missing_secret_is_terminal() {
        let store = MemoryStore::<Secret>::new();
        let err = resolve_parameters(&store, "default", None, &[from_secret("absent", "parameters")])
            .await
            .unwrap_err();
        assert!(matches!(err, ParametersError::SecretNotFound(_)));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_missing_key_is_terminal() {
        let store = store_with("param-secret", "other", "{}").await;
        let err = resolve_parameters(
            &store,
            "default",
            None,
            &[from_secret("param-secret", "parameters")],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ParametersError::MissingKey { .. }));
    }

    #[tokio::test]
    async fn test_non_object_fragment_is_rejected() {
        let store = store_with("param-secret", "parameters", r#"["a","b"]"#).await;
        let err = resolve_parameters(
            &store,
            "default",
            None,
            &[from_secret("param-secret", "parameters")],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("got an array"), "{err}");
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_no_parameters_resolves_to_none() {
        let store = MemoryStore::<Secret>::new();
        let resolved = resolve_parameters(&store, "default", None, &[]).await.unwrap();
        assert_eq!(resolved, ResolvedParameters::default());
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a: Parameters = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Parameters = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(parameters_checksum(&a), parameters_checksum(&b));
        assert_eq!(parameters_checksum(&a).len(), 64);
    }
}
