//! # Broker Client Manager
//!
//! Owns one [`BrokerClient`] per broker, keyed by namespace/name.
//!
//! A cached client is reused while the connection parameters derived from the
//! broker spec and the contents of its auth secret stay the same. Secret
//! rotation does not change the broker's generation, so the secret is read
//! again on every [`BrokerClientManager::get_client`] call and compared.
//!
//! Access is serialized per broker key; different brokers never wait on each other.

use super::{BrokerClient, BrokerError, HttpBrokerClient};
use crate::constants::{BASIC_AUTH_PASSWORD_KEY, BASIC_AUTH_USERNAME_KEY, BEARER_TOKEN_KEY};
use crate::crd::{SecretReference, ServiceBroker};
use crate::store::{ObjectKey, SharedStore, StoreError};
use base64::{engine::general_purpose, Engine as _};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Credentials presented to a broker
#[derive(Clone, PartialEq, Eq)]
pub enum BrokerAuth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl std::fmt::Debug for BrokerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Everything a client is built from; a change in any field rebuilds the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerClientConfig {
    pub name: String,
    pub url: String,
    /// Decoded PEM bundle
    pub ca_bundle: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub auth: Option<BrokerAuth>,
    pub api_version: String,
    pub timeout: Duration,
}

/// Failure to resolve broker credentials
#[derive(Debug, Error)]
pub enum AuthResolutionError {
    #[error("auth secret {0} not found")]
    SecretNotFound(String),
    #[error("auth secret {secret} has no key {key}")]
    MissingKey { secret: String, key: String },
    #[error("auth secret {secret} key {key} is not valid UTF-8")]
    InvalidValue { secret: String, key: String },
    #[error("failed to read auth secret: {0}")]
    Store(#[from] StoreError),
}

/// Failure to produce a client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Auth(#[from] AuthResolutionError),
    #[error("invalid caBundle: {0}")]
    InvalidCaBundle(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Constructs protocol clients
pub trait BrokerClientFactory: Send + Sync {
    /// # Errors
    ///
    /// Fails when the configuration cannot produce a working client.
    fn create(&self, config: &BrokerClientConfig) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}

/// Factory for [`HttpBrokerClient`]
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpBrokerClientFactory;

impl BrokerClientFactory for HttpBrokerClientFactory {
    fn create(&self, config: &BrokerClientConfig) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        Ok(Arc::new(HttpBrokerClient::new(config)?))
    }
}

struct CachedClient {
    config: BrokerClientConfig,
    client: Arc<dyn BrokerClient>,
}

type Slot = Arc<tokio::sync::Mutex<Option<CachedClient>>>;

/// Per-broker client cache
pub struct BrokerClientManager {
    factory: Arc<dyn BrokerClientFactory>,
    secrets: SharedStore<Secret>,
    api_version: String,
    timeout: Duration,
    slots: Mutex<HashMap<ObjectKey, Slot>>,
}

impl std::fmt::Debug for BrokerClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClientManager")
            .field("api_version", &self.api_version)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BrokerClientManager {
    #[must_use]
    pub fn new(
        factory: Arc<dyn BrokerClientFactory>,
        secrets: SharedStore<Secret>,
        api_version: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            factory,
            secrets,
            api_version: api_version.into(),
            timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &ObjectKey) -> Slot {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Return the client for a broker, rebuilding it when its configuration changed
    ///
    /// # Errors
    ///
    /// - [`ClientError::Auth`] when the auth secret or one of its keys is missing
    /// - [`ClientError::InvalidCaBundle`] when `caBundle` is not base64
    /// - [`ClientError::Broker`] when the factory cannot build a client
    pub async fn get_client(
        &self,
        broker: &ServiceBroker,
    ) -> Result<Arc<dyn BrokerClient>, ClientError> {
        let key = ObjectKey::of(broker);
        let slot = self.slot(&key);
        let mut cached = slot.lock().await;

        let config = self.resolve_config(broker).await?;
        if let Some(existing) = cached.as_ref() {
            if existing.config == config {
                return Ok(Arc::clone(&existing.client));
            }
            info!(broker.name = %key, "broker connection settings changed, rebuilding client");
        } else {
            debug!(broker.name = %key, "creating broker client");
        }

        let client = self.factory.create(&config)?;
        *cached = Some(CachedClient {
            config,
            client: Arc::clone(&client),
        });
        Ok(client)
    }

    /// Evict the cached client of a deleted broker
    pub fn forget(&self, key: &ObjectKey) {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slots.remove(key).is_some() {
            debug!(broker.name = %key, "forgot broker client");
        }
    }

    /// Number of brokers with a cache slot
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn resolve_config(&self, broker: &ServiceBroker) -> Result<BrokerClientConfig, ClientError> {
        let namespace = broker.namespace().unwrap_or_else(|| "default".to_string());
        let ca_bundle = broker
            .spec
            .ca_bundle
            .as_deref()
            .filter(|bundle| !bundle.is_empty())
            .map(|bundle| {
                general_purpose::STANDARD
                    .decode(bundle.trim())
                    .map_err(|e| ClientError::InvalidCaBundle(e.to_string()))
            })
            .transpose()?;

        let auth = match &broker.spec.auth_info {
            Some(info) => {
                if let Some(basic) = &info.basic {
                    let secret = self.fetch_secret(&basic.secret_ref, &namespace).await?;
                    Some(BrokerAuth::Basic {
                        username: secret_value(&secret, BASIC_AUTH_USERNAME_KEY)?,
                        password: secret_value(&secret, BASIC_AUTH_PASSWORD_KEY)?,
                    })
                } else if let Some(bearer) = &info.bearer {
                    let secret = self.fetch_secret(&bearer.secret_ref, &namespace).await?;
                    Some(BrokerAuth::Bearer {
                        token: secret_value(&secret, BEARER_TOKEN_KEY)?,
                    })
                } else {
                    None
                }
            }
            None => None,
        };

        Ok(BrokerClientConfig {
            name: broker.name_any(),
            url: broker.spec.url.clone(),
            ca_bundle,
            insecure_skip_tls_verify: broker.spec.insecure_skip_tls_verify,
            auth,
            api_version: self.api_version.clone(),
            timeout: self.timeout,
        })
    }

    async fn fetch_secret(
        &self,
        reference: &SecretReference,
        default_namespace: &str,
    ) -> Result<Secret, AuthResolutionError> {
        let key = ObjectKey::new(
            reference
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
            reference.name.clone(),
        );
        self.secrets
            .get(&key)
            .await?
            .ok_or_else(|| AuthResolutionError::SecretNotFound(key.to_string()))
    }
}

/// Read one key of a secret, from `data` first and then `stringData`
fn secret_value(secret: &Secret, key: &str) -> Result<String, AuthResolutionError> {
    let secret_name = secret.name_any();
    if let Some(bytes) = secret.data.as_ref().and_then(|data| data.get(key)) {
        return String::from_utf8(bytes.0.clone()).map_err(|_| AuthResolutionError::InvalidValue {
            secret: secret_name,
            key: key.to_string(),
        });
    }
    secret
        .string_data
        .as_ref()
        .and_then(|data| data.get(key))
        .cloned()
        .ok_or_else(|| AuthResolutionError::MissingKey {
            secret: secret_name,
            key: key.to_string(),
        })
}
