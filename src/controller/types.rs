//! # Types
//!
//! Context shared by every reconciler, plus the result types the dispatcher consumes.

use crate::broker::{
    AuthResolutionError, BrokerClientManager, BrokerError, ClientError, OriginatingIdentity,
};
use crate::config::ControllerConfig;
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::catalog::CatalogFetchError;
use crate::crd::UserInfo;
use crate::store::{ObjectKey, StoreError, Stores};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("object store error: {0}")]
    Store(StoreError),
    /// Stale write; retried immediately after a fresh read
    #[error("{0}")]
    Conflict(String),
    #[error("broker call failed: {0}")]
    Broker(#[from] BrokerError),
    #[error("failed to resolve broker credentials: {0}")]
    Auth(#[from] AuthResolutionError),
    #[error(transparent)]
    Catalog(#[from] CatalogFetchError),
    #[error("{0}")]
    Transient(String),
    #[error("Reconciliation failed: {0}")]
    Other(#[from] anyhow::Error),
}

impl ReconcileError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        if err.is_conflict() {
            Self::Conflict(err.to_string())
        } else {
            Self::Store(err)
        }
    }
}

impl From<ClientError> for ReconcileError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Auth(e) => Self::Auth(e),
            ClientError::Broker(e) => Self::Broker(e),
            ClientError::InvalidCaBundle(msg) => {
                Self::Other(anyhow::anyhow!("invalid caBundle: {msg}"))
            }
        }
    }
}

/// What the dispatcher does with a key after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Nothing left to do until the next watch event
    Done,
    /// Reconcile again after a fixed delay (async polls, relist timers)
    RequeueAfter(Duration),
    /// Reconcile again with the key's rate-limited backoff, without counting an error
    Retry,
}

/// Trigger source for a reconcile, used in logs and requeue metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    WatchEvent,
    ErrorBackoff,
    Conflict,
    Timer,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::WatchEvent => "watch-event",
            TriggerSource::ErrorBackoff => "error-backoff",
            TriggerSource::Conflict => "conflict",
            TriggerSource::Timer => "timer",
        }
    }
}

/// State shared by the broker, catalog, instance and binding reconcilers
pub struct Context {
    pub stores: Stores,
    pub clients: Arc<BrokerClientManager>,
    pub config: ControllerConfig,
    // Poll delays per (kind, namespace/name); reset when an async operation resolves
    poll_backoffs: Mutex<HashMap<(&'static str, ObjectKey), ExponentialBackoff>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Context {
    #[must_use]
    pub fn new(stores: Stores, clients: Arc<BrokerClientManager>, config: ControllerConfig) -> Self {
        Self {
            stores,
            clients,
            config,
            poll_backoffs: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before the next last-operation poll of a key
    pub fn next_poll_delay(&self, kind: &'static str, key: &ObjectKey) -> Duration {
        let mut backoffs = self
            .poll_backoffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        backoffs
            .entry((kind, key.clone()))
            .or_insert_with(|| {
                ExponentialBackoff::new(
                    self.config.poll_interval_start(),
                    self.config.poll_interval_max(),
                )
            })
            .next_backoff()
    }

    /// Originating identity sent with a broker call, when enabled and known
    pub fn originating_identity(&self, user: Option<&UserInfo>) -> Option<OriginatingIdentity> {
        if !self.config.originating_identity {
            return None;
        }
        match OriginatingIdentity::from_user_info(user?) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("failed to encode originating identity: {}", e);
                None
            }
        }
    }

    /// Platform context sent with provision, update and bind calls
    pub fn request_context(&self, namespace: &str, instance_name: &str) -> serde_json::Value {
        serde_json::json!({
            "platform": crate::constants::ORIGINATING_IDENTITY_PLATFORM,
            "namespace": namespace,
            "instance_name": instance_name,
            "clusterid": self.config.cluster_id,
        })
    }

    /// Forget the poll delay of a key whose async operation resolved
    pub fn reset_poll(&self, kind: &'static str, key: &ObjectKey) {
        self.poll_backoffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, key.clone()));
    }
}
