//! # Broker Protocol
//!
//! Typed Open Service Broker client surface consumed by the state machines.
//!
//! - [`BrokerClient`]: one method per broker operation, each returning a tagged
//!   response variant (completed or in progress) or a [`BrokerError`]
//! - [`HttpBrokerClient`]: the reqwest implementation of the OSB REST API
//! - [`BrokerClientManager`]: per-broker client cache, rebuilt when the
//!   connection parameters or the resolved credentials change

mod http;
mod manager;

pub use http::HttpBrokerClient;
pub use manager::{
    AuthResolutionError, BrokerAuth, BrokerClientConfig, BrokerClientFactory,
    BrokerClientManager, ClientError, HttpBrokerClientFactory,
};

use crate::constants::ORIGINATING_IDENTITY_PLATFORM;
use crate::crd::UserInfo;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Structured parameters sent with provision, update and bind calls
pub type Parameters = Map<String, Value>;

/// Credentials returned by a bind
pub type Credentials = Map<String, Value>;

// ============================================================================
// Catalog
// ============================================================================

/// Response of `GET /v2/catalog`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogResponse {
    #[serde(default)]
    pub services: Vec<Service>,
}

/// A service offering
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updateable: Option<bool>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

/// A plan of a service offering
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub free: Option<bool>,
    #[serde(default)]
    pub bindable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

// ============================================================================
// Requests
// ============================================================================

/// Platform identity of the user behind a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginatingIdentity {
    pub platform: String,
    /// base64 of the JSON-encoded user info
    pub value: String,
}

impl OriginatingIdentity {
    /// Encode a user for the `X-Broker-API-Originating-Identity` header
    ///
    /// # Errors
    ///
    /// Fails only if the user info cannot be serialized.
    pub fn from_user_info(user: &UserInfo) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_vec(user)?;
        Ok(Self {
            platform: ORIGINATING_IDENTITY_PLATFORM.to_string(),
            value: general_purpose::STANDARD.encode(json),
        })
    }

    #[must_use]
    pub fn header_value(&self) -> String {
        format!("{} {}", self.platform, self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    pub parameters: Option<Parameters>,
    pub context: Value,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub instance_id: String,
    pub service_id: String,
    /// Only set when the plan changes
    pub plan_id: Option<String>,
    pub previous_plan_id: Option<String>,
    pub parameters: Option<Parameters>,
    pub context: Value,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastOperationRequest {
    pub instance_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation: Option<String>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub parameters: Option<Parameters>,
    pub context: Value,
    /// Allow the broker to answer asynchronously
    pub accepts_incomplete: bool,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnbindRequest {
    pub binding_id: String,
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub accepts_incomplete: bool,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingLastOperationRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub operation: Option<String>,
    pub originating_identity: Option<OriginatingIdentity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetBindingRequest {
    pub instance_id: String,
    pub binding_id: String,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionResponse {
    Completed {
        dashboard_url: Option<String>,
    },
    InProgress {
        dashboard_url: Option<String>,
        operation: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateResponse {
    Completed { dashboard_url: Option<String> },
    InProgress { operation: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeprovisionResponse {
    Completed,
    InProgress { operation: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindResponse {
    Completed { credentials: Credentials },
    InProgress { operation: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnbindResponse {
    Completed,
    InProgress { operation: Option<String> },
}

/// State reported by a last-operation poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetBindingResponse {
    pub credentials: Credentials,
}

// ============================================================================
// Errors
// ============================================================================

/// Broker call kinds, used for error classification, spans and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Catalog,
    Provision,
    Update,
    Deprovision,
    PollInstance,
    Bind,
    Unbind,
    PollBinding,
    GetBinding,
}

impl CallKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Provision => "provision",
            Self::Update => "update",
            Self::Deprovision => "deprovision",
            Self::PollInstance => "poll_last_operation",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
            Self::PollBinding => "poll_binding_last_operation",
            Self::GetBinding => "get_binding",
        }
    }

    /// Calls that may create a broker-side resource
    #[must_use]
    pub fn is_create(self) -> bool {
        matches!(self, Self::Provision | Self::Bind)
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a failed broker call must be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Retry with backoff; never terminal
    Transient,
    /// Definitive rejection; terminal for the current generation
    Rejected,
    /// The broker may have acted; orphan mitigation is required
    Ambiguous,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Rejected => "rejected",
            Self::Ambiguous => "ambiguous",
        }
    }
}

/// Broker call errors
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("{}", format_http_status(.status, .error_message.as_deref(), .description.as_deref()))]
    HttpStatus {
        status: u16,
        error_message: Option<String>,
        description: Option<String>,
    },
    #[error("broker request timed out")]
    Timeout,
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("malformed broker response: {0}")]
    Malformed(String),
    #[error("broker answered asynchronously to a request that did not accept incomplete operations")]
    AsyncNotSupported,
}

#[allow(
    clippy::trivially_copy_pass_by_ref,
    reason = "Called from the error derive with field references"
)]
fn format_http_status(
    status: &u16,
    error_message: Option<&str>,
    description: Option<&str>,
) -> String {
    let mut message = format!("Status: {status}");
    if let Some(error_message) = error_message {
        message.push_str("; ErrorMessage: ");
        message.push_str(error_message);
    }
    if let Some(description) = description {
        message.push_str("; Description: ");
        message.push_str(description);
    }
    message
}

/// OSB error code asking the platform to retry later
const CONCURRENCY_ERROR: &str = "ConcurrencyError";

impl BrokerError {
    /// Classify a failed call
    ///
    /// - 408 counts as a timeout
    /// - 409 is transient for provision and update, and a rejection for bind
    /// - 422 `ConcurrencyError` is transient
    /// - other 4xx are rejections
    /// - transport failures, timeouts, 5xx, malformed bodies and unexpected 2xx
    ///   are ambiguous for create-type calls and transient otherwise
    #[must_use]
    pub fn classify(&self, call: CallKind) -> Outcome {
        let unknown_result = if call.is_create() {
            Outcome::Ambiguous
        } else {
            Outcome::Transient
        };
        match self {
            Self::Transport(_) | Self::Timeout | Self::Malformed(_) | Self::AsyncNotSupported => {
                unknown_result
            }
            Self::HttpStatus {
                status,
                error_message,
                ..
            } => match *status {
                408 => unknown_result,
                409 => match call {
                    CallKind::Bind => Outcome::Rejected,
                    _ => Outcome::Transient,
                },
                422 if error_message.as_deref() == Some(CONCURRENCY_ERROR) => Outcome::Transient,
                400..=499 => Outcome::Rejected,
                _ => unknown_result,
            },
        }
    }

    /// 410: the resource no longer exists on the broker
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 410, .. })
    }

    /// HTTP status of the failure, if the broker answered
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Open Service Broker client
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_catalog(&self) -> Result<CatalogResponse, BrokerError>;

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, BrokerError>;

    async fn update_instance(&self, request: &UpdateRequest)
        -> Result<UpdateResponse, BrokerError>;

    /// 410 Gone is reported as [`DeprovisionResponse::Completed`]
    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError>;

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError>;

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError>;

    /// 410 Gone is reported as [`UnbindResponse::Completed`]
    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, BrokerError>;

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError>;

    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, BrokerError>;
}
