//! # Secret Transforms
//!
//! Shapes the credentials returned by a bind before they are written to the binding's
//! secret. Transforms run in declaration order:
//!
//! - `addKey`: literal bytes (`value`, base64), literal text (`stringValue`), or a value
//!   extracted from the credentials with a structured path (`jsonPathExpression`)
//! - `renameKey`: no-op when the source key is absent
//! - `removeKey`: no-op when the key is absent
//! - `addKeysFrom`: merges every key of another secret, read fresh, later keys winning
//!
//! A path that resolves to nothing is an error; every other no-op is tolerated so
//! transform lists survive changes in the broker's credential shape.

use crate::broker::Credentials;
use crate::crd::{AddKeyTransform, SecretTransform};
use crate::store::{ObjectKey, ObjectStore, StoreError};
use base64::{engine::general_purpose, Engine as _};
use k8s_openapi::api::core::v1::Secret;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Secret contents keyed by data key
pub type SecretData = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("secretTransforms[{0}] sets no operation")]
    EmptyTransform(usize),
    #[error("addKey {0} sets none of value, stringValue or jsonPathExpression")]
    EmptyAddKey(String),
    #[error("addKey {key} value is not valid base64: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("invalid path expression {0:?}")]
    InvalidPath(String),
    #[error("path expression {0:?} did not resolve to a value")]
    PathNotFound(String),
    #[error("secret {0} referenced by addKeysFrom not found")]
    SecretNotFound(String),
    #[error("failed to read secret for addKeysFrom: {0}")]
    Store(#[from] StoreError),
}

impl TransformError {
    /// Everything but store read failures needs a user edit to fix
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// Flatten broker credentials: strings keep their text, anything else is JSON-encoded
#[must_use]
pub fn credentials_to_secret_data(credentials: &Credentials) -> SecretData {
    credentials
        .iter()
        .map(|(key, value)| {
            let bytes = match value {
                Value::String(s) => s.as_bytes().to_vec(),
                other => other.to_string().into_bytes(),
            };
            (key.clone(), bytes)
        })
        .collect()
}

/// Apply transforms in order
///
/// # Errors
///
/// Returns a terminal [`TransformError`] for malformed transforms and unresolved
/// paths, and [`TransformError::Store`] when a referenced secret cannot be read.
pub async fn transform_secret(
    secrets: &dyn ObjectStore<Secret>,
    namespace: &str,
    mut data: SecretData,
    transforms: &[SecretTransform],
) -> Result<SecretData, TransformError> {
    for (index, transform) in transforms.iter().enumerate() {
        if let Some(add) = &transform.add_key {
            let value = add_key_value(&data, add)?;
            data.insert(add.key.clone(), value);
        } else if let Some(rename) = &transform.rename_key {
            if let Some(value) = data.remove(&rename.from) {
                data.insert(rename.to.clone(), value);
            }
        } else if let Some(remove) = &transform.remove_key {
            data.remove(&remove.key);
        } else if let Some(from) = &transform.add_keys_from {
            let reference = &from.secret_ref;
            let key = ObjectKey::new(
                reference.namespace.as_deref().unwrap_or(namespace),
                &reference.name,
            );
            let secret = secrets
                .get(&key)
                .await?
                .ok_or_else(|| TransformError::SecretNotFound(key.to_string()))?;
            data.extend(secret_data(&secret));
        } else {
            return Err(TransformError::EmptyTransform(index));
        }
    }
    Ok(data)
}

fn add_key_value(data: &SecretData, add: &AddKeyTransform) -> Result<Vec<u8>, TransformError> {
    if let Some(encoded) = &add.value {
        return general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| TransformError::InvalidValue {
                key: add.key.clone(),
                reason: e.to_string(),
            });
    }
    if let Some(text) = &add.string_value {
        return Ok(text.as_bytes().to_vec());
    }
    if let Some(expression) = &add.json_path_expression {
        return evaluate_path(data, expression);
    }
    Err(TransformError::EmptyAddKey(add.key.clone()))
}

/// Every key of a secret, `stringData` overriding `data`
fn secret_data(secret: &Secret) -> SecretData {
    let mut merged: SecretData = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), v.0.clone()))
        .collect();
    merged.extend(
        secret
            .string_data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.as_bytes().to_vec())),
    );
    merged
}

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// Parse `{.a.b[0]}` (braces optional) into path segments
fn parse_path(expression: &str) -> Result<Vec<Segment>, TransformError> {
    let invalid = || TransformError::InvalidPath(expression.to_string());
    let trimmed = expression.trim();
    let inner = match trimmed.strip_prefix('{') {
        Some(rest) => rest.strip_suffix('}').ok_or_else(invalid)?,
        None => trimmed,
    };
    let inner = inner.strip_prefix('.').ok_or_else(invalid)?;

    let mut segments = Vec::new();
    for part in inner.split('.') {
        let (field, mut indexes) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if field.is_empty() && (segments.is_empty() || indexes.is_empty()) {
            return Err(invalid());
        }
        if !field.is_empty() {
            segments.push(Segment::Field(field.to_string()));
        }
        while !indexes.is_empty() {
            let close = indexes.find(']').ok_or_else(invalid)?;
            let index = indexes[1..close].parse().map_err(|_| invalid())?;
            segments.push(Segment::Index(index));
            indexes = &indexes[close + 1..];
            if !indexes.is_empty() && !indexes.starts_with('[') {
                return Err(invalid());
            }
        }
    }
    Ok(segments)
}

/// Evaluate a path against secret data
///
/// The first field selects a key; later segments descend into that key's value
/// decoded as JSON. String leaves yield their text, other leaves their JSON encoding.
///
/// # Errors
///
/// [`TransformError::InvalidPath`] for unparsable expressions and
/// [`TransformError::PathNotFound`] when nothing matches.
pub fn evaluate_path(data: &SecretData, expression: &str) -> Result<Vec<u8>, TransformError> {
    let not_found = || TransformError::PathNotFound(expression.to_string());
    let segments = parse_path(expression)?;
    let Some((Segment::Field(first), rest)) = segments.split_first() else {
        return Err(TransformError::InvalidPath(expression.to_string()));
    };
    let raw = data.get(first).ok_or_else(not_found)?;
    if rest.is_empty() {
        return Ok(raw.clone());
    }

    let mut current: Value = serde_json::from_slice(raw).map_err(|_| not_found())?;
    for segment in rest {
        current = match (segment, current) {
            (Segment::Field(name), Value::Object(mut map)) => map.remove(name),
            (Segment::Index(index), Value::Array(mut items)) if *index < items.len() => {
                Some(items.swap_remove(*index))
            }
            _ => None,
        }
        .ok_or_else(not_found)?;
    }
    match current {
        Value::Null => Err(not_found()),
        Value::String(s) => Ok(s.into_bytes()),
        other => Ok(other.to_string().into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AddKeysFromTransform, RemoveKeyTransform, RenameKeyTransform, SecretReference,
    };
    use crate::store::MemoryStore;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use serde_json::json;

    fn base_data() -> SecretData {
        SecretData::from([
            ("foo".to_string(), b"bar".to_vec()),
            ("baz".to_string(), b"zap".to_vec()),
        ])
    }

    fn rename(from: &str, to: &str) -> SecretTransform {
        SecretTransform {
            rename_key: Some(RenameKeyTransform {
                from: from.to_string(),
                to: to.to_string(),
            }),
            ..SecretTransform::default()
        }
    }

    fn remove(key: &str) -> SecretTransform {
        SecretTransform {
            remove_key: Some(RemoveKeyTransform {
                key: key.to_string(),
            }),
            ..SecretTransform::default()
        }
    }

    fn add(key: &str, f: impl FnOnce(&mut AddKeyTransform)) -> SecretTransform {
        let mut add = AddKeyTransform {
            key: key.to_string(),
            ..AddKeyTransform::default()
        };
        f(&mut add);
        SecretTransform {
            add_key: Some(add),
            ..SecretTransform::default()
        }
    }

    #[tokio::test]
    async fn test_rename_and_remove() {
        let store = MemoryStore::<Secret>::new();
        let result = transform_secret(
            &store,
            "default",
            base_data(),
            &[rename("foo", "bar"), remove("baz")],
        )
        .await
        .unwrap();
        assert_eq!(result, SecretData::from([("bar".to_string(), b"bar".to_vec())]));
    }

    #[tokio::test]
    async fn test_missing_keys_are_no_ops() {
        let store = MemoryStore::<Secret>::new();
        let result = transform_secret(
            &store,
            "default",
            base_data(),
            &[rename("non-existent-key", "bar"), remove("also-missing")],
        )
        .await
        .unwrap();
        assert_eq!(result, base_data());
    }

    #[tokio::test]
    async fn test_multiple_transforms_in_order() {
        let store = MemoryStore::<Secret>::new();
        store
            .create(&Secret {
                metadata: ObjectMeta {
                    name: Some("other-secret".to_string()),
                    namespace: Some("default".to_string()),
                    ..ObjectMeta::default()
                },
                data: Some(BTreeMap::from([(
                    "key-from-other-secret".to_string(),
                    ByteString(b"qux".to_vec()),
                )])),
                ..Secret::default()
            })
            .await
            .unwrap();

        let transforms = vec![
            add("addedStringValue", |a| a.string_value = Some("stringValue".into())),
            add("addedByteArray", |a| {
                a.value = Some(general_purpose::STANDARD.encode("byteArray"));
            }),
            add("valueFromJSONPath", |a| a.json_path_expression = Some("{.foo}".into())),
            rename("foo", "bar"),
            SecretTransform {
                add_keys_from: Some(AddKeysFromTransform {
                    secret_ref: SecretReference {
                        name: "other-secret".to_string(),
                        namespace: None,
                    },
                }),
                ..SecretTransform::default()
            },
            remove("baz"),
        ];

        let result = transform_secret(&store, "default", base_data(), &transforms)
            .await
            .unwrap();
        let expected = SecretData::from([
            ("addedStringValue".to_string(), b"stringValue".to_vec()),
            ("addedByteArray".to_string(), b"byteArray".to_vec()),
            ("valueFromJSONPath".to_string(), b"bar".to_vec()),
            ("bar".to_string(), b"bar".to_vec()),
            ("key-from-other-secret".to_string(), b"qux".to_vec()),
        ]);
        assert_eq!(result, expected);
    }

    #[tokio::test]
    async fn test_missing_add_keys_from_secret_fails() {
        let store = MemoryStore::<Secret>::new();
        let transform = SecretTransform {
            add_keys_from: Some(AddKeysFromTransform {
                secret_ref: SecretReference {
                    name: "absent".to_string(),
                    namespace: None,
                },
            }),
            ..SecretTransform::default()
        };
        let err = transform_secret(&store, "default", base_data(), &[transform])
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::SecretNotFound(_)));
    }

    #[test]
    fn test_nested_paths_descend_into_json_values() {
        let credentials = json!({
            "uri": "postgres://db",
            "db": {"host": "10.0.0.1", "ports": [5432, 5433]},
        });
        let data = credentials_to_secret_data(credentials.as_object().unwrap());
        assert_eq!(evaluate_path(&data, "{.uri}").unwrap(), b"postgres://db");
        assert_eq!(evaluate_path(&data, "{.db.host}").unwrap(), b"10.0.0.1");
        assert_eq!(evaluate_path(&data, "{.db.ports[1]}").unwrap(), b"5433");
        assert_eq!(evaluate_path(&data, ".db.ports").unwrap(), b"[5432,5433]");
    }

    #[test]
    fn test_unresolved_path_is_an_error() {
        let data = base_data();
        assert!(matches!(
            evaluate_path(&data, "{.missing}"),
            Err(TransformError::PathNotFound(_))
        ));
        assert!(matches!(
            evaluate_path(&data, "{.foo.deeper}"),
            Err(TransformError::PathNotFound(_))
        ));
        assert!(matches!(
            evaluate_path(&data, "foo"),
            Err(TransformError::InvalidPath(_))
        ));
        assert!(matches!(
            evaluate_path(&data, "{.a[x]}"),
            Err(TransformError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_transform_is_rejected() {
        let store = MemoryStore::<Secret>::new();
        let err = transform_secret(&store, "default", base_data(), &[SecretTransform::default()])
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::EmptyTransform(0)));
    }
}
