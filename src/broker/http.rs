//! # OSB REST Client
//!
//! reqwest implementation of [`BrokerClient`] against the Open Service Broker API v2.
//!
//! Every call:
//! - carries `X-Broker-API-Version` and, when known, the originating identity header
//! - authenticates with basic or bearer credentials from the broker's secret
//! - runs inside a `broker.call` span tagged with the operation and records
//!   request count and duration by outcome
//!
//! Error bodies of the form `{"error": "...", "description": "..."}` are decoded
//! into [`BrokerError::HttpStatus`].

use super::{
    BindRequest, BindResponse, BindingLastOperationRequest, BrokerAuth, BrokerClient,
    BrokerClientConfig, BrokerError, CallKind, CatalogResponse, Credentials, DeprovisionRequest,
    DeprovisionResponse, GetBindingRequest, GetBindingResponse, LastOperationRequest,
    LastOperationResponse, OriginatingIdentity, ProvisionRequest, ProvisionResponse,
    UnbindRequest, UnbindResponse, UpdateRequest, UpdateResponse,
};
use crate::constants::ORIGINATING_IDENTITY_HEADER;
use crate::observability::metrics;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info_span, Instrument, Span};

/// Open Service Broker REST client
pub struct HttpBrokerClient {
    http_client: Client,
    name: String,
    base_url: String,
    api_version: String,
    auth: Option<BrokerAuth>,
}

impl std::fmt::Debug for HttpBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBrokerClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Wire structures
// ============================================================================

#[derive(Debug, Serialize)]
struct ProvisionBody<'a> {
    service_id: &'a str,
    plan_id: &'a str,
    organization_guid: &'a str,
    space_guid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a super::Parameters>,
    context: &'a Value,
}

#[derive(Debug, Serialize)]
struct PreviousValues<'a> {
    plan_id: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateBody<'a> {
    service_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a super::Parameters>,
    context: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_values: Option<PreviousValues<'a>>,
}

#[derive(Debug, Serialize)]
struct BindBody<'a> {
    service_id: &'a str,
    plan_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a super::Parameters>,
    context: &'a Value,
}

#[derive(Debug, Default, Deserialize)]
struct AsyncOperationBody {
    #[serde(default)]
    dashboard_url: Option<String>,
    #[serde(default)]
    operation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BindingBody {
    #[serde(default)]
    credentials: Option<Credentials>,
    #[serde(default)]
    operation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Records metrics and span fields for one broker call
struct CallTracker {
    start: Instant,
    span: Span,
    call: CallKind,
}

impl CallTracker {
    fn new(span: Span, call: CallKind) -> Self {
        Self {
            start: Instant::now(),
            span,
            call,
        }
    }

    fn record<T>(&self, result: &Result<T, BrokerError>) {
        let elapsed = self.start.elapsed();
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Call durations are far below u64::MAX milliseconds"
        )]
        self.span
            .record("operation.duration_ms", elapsed.as_millis() as u64);
        let outcome = match result {
            Ok(_) => "success",
            Err(e) => {
                self.span.record("error.message", e.to_string().as_str());
                if let Some(status) = e.status() {
                    self.span.record("http.status", u64::from(status));
                }
                e.classify(self.call).as_str()
            }
        };
        self.span.record("operation.outcome", outcome);
        metrics::record_broker_request(self.call.as_str(), outcome, elapsed.as_secs_f64());
    }
}

fn call_span(call: CallKind, broker: &str) -> Span {
    info_span!(
        "broker.call",
        broker.name = %broker,
        operation = call.as_str(),
        operation.outcome = tracing::field::Empty,
        operation.duration_ms = tracing::field::Empty,
        http.status = tracing::field::Empty,
        error.message = tracing::field::Empty,
    )
}

impl HttpBrokerClient {
    /// Build a client from resolved connection parameters
    ///
    /// # Errors
    ///
    /// Fails when the CA bundle is not valid PEM or the TLS backend cannot be
    /// initialized.
    pub fn new(config: &BrokerClientConfig) -> Result<Self, BrokerError> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);

        if let Some(ca_bundle) = &config.ca_bundle {
            let certificates = reqwest::Certificate::from_pem_bundle(ca_bundle)
                .map_err(|e| BrokerError::Transport(format!("invalid CA bundle: {e}")))?;
            for certificate in certificates {
                builder = builder.add_root_certificate(certificate);
            }
        }

        let http_client = builder
            .build()
            .map_err(|e| BrokerError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            name: config.name.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            auth: config.auth.clone(),
        })
    }

    /// Build HTTP request with API version, authentication and identity headers
    fn make_request(
        &self,
        method: Method,
        path: &str,
        identity: Option<&OriginatingIdentity>,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http_client
            .request(method, &url)
            .header("X-Broker-API-Version", &self.api_version);

        request = match &self.auth {
            Some(BrokerAuth::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(BrokerAuth::Bearer { token }) => request.bearer_auth(token),
            None => request,
        };

        if let Some(identity) = identity {
            request = request.header(ORIGINATING_IDENTITY_HEADER, identity.header_value());
        }

        request
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(StatusCode, String), BrokerError> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;
        debug!("broker responded with HTTP {}", status.as_u16());
        Ok((status, body))
    }

    async fn traced<T, F>(&self, call: CallKind, fut: F) -> Result<T, BrokerError>
    where
        F: std::future::Future<Output = Result<T, BrokerError>> + Send,
    {
        let span = call_span(call, &self.name);
        let tracker = CallTracker::new(span.clone(), call);
        let result = fut.instrument(span).await;
        tracker.record(&result);
        result
    }
}

fn map_transport_error(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Timeout
    } else {
        BrokerError::Transport(e.to_string())
    }
}

/// Handle OSB error responses
fn handle_error_response(status: StatusCode, body: &str) -> BrokerError {
    let (error_message, description) = match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => (parsed.error, parsed.description),
        Err(_) if body.trim().is_empty() => (None, None),
        Err(_) => (None, Some(body.trim().to_string())),
    };
    BrokerError::HttpStatus {
        status: status.as_u16(),
        error_message,
        description,
    }
}

fn parse_body<T: DeserializeOwned + Default>(body: &str) -> Result<T, BrokerError> {
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(body).map_err(|e| BrokerError::Malformed(e.to_string()))
}

fn accepts_incomplete(enabled: bool) -> &'static [(&'static str, &'static str)] {
    if enabled {
        &[("accepts_incomplete", "true")]
    } else {
        &[]
    }
}

fn last_operation_query(
    service_id: Option<&String>,
    plan_id: Option<&String>,
    operation: Option<&String>,
) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(operation) = operation {
        query.push(("operation", operation.clone()));
    }
    if let Some(service_id) = service_id {
        query.push(("service_id", service_id.clone()));
    }
    if let Some(plan_id) = plan_id {
        query.push(("plan_id", plan_id.clone()));
    }
    query
}

fn parse_last_operation(status: StatusCode, body: &str) -> Result<LastOperationResponse, BrokerError> {
    if status == StatusCode::OK {
        serde_json::from_str(body).map_err(|e| BrokerError::Malformed(e.to_string()))
    } else {
        Err(handle_error_response(status, body))
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn get_catalog(&self) -> Result<CatalogResponse, BrokerError> {
        self.traced(CallKind::Catalog, async {
            let (status, body) = self
                .send(self.make_request(Method::GET, "/v2/catalog", None))
                .await?;
            if status == StatusCode::OK {
                serde_json::from_str(&body).map_err(|e| BrokerError::Malformed(e.to_string()))
            } else {
                Err(handle_error_response(status, &body))
            }
        })
        .await
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, BrokerError> {
        self.traced(CallKind::Provision, async {
            let body = ProvisionBody {
                service_id: &request.service_id,
                plan_id: &request.plan_id,
                organization_guid: &request.organization_guid,
                space_guid: &request.space_guid,
                parameters: request.parameters.as_ref(),
                context: &request.context,
            };
            let path = format!("/v2/service_instances/{}", request.instance_id);
            let (status, text) = self
                .send(
                    self.make_request(Method::PUT, &path, request.originating_identity.as_ref())
                        .query(accepts_incomplete(true))
                        .json(&body),
                )
                .await?;
            match status {
                StatusCode::OK | StatusCode::CREATED => {
                    let parsed: AsyncOperationBody = parse_body(&text)?;
                    Ok(ProvisionResponse::Completed {
                        dashboard_url: parsed.dashboard_url,
                    })
                }
                StatusCode::ACCEPTED => {
                    let parsed: AsyncOperationBody = parse_body(&text)?;
                    Ok(ProvisionResponse::InProgress {
                        dashboard_url: parsed.dashboard_url,
                        operation: parsed.operation,
                    })
                }
                _ => Err(handle_error_response(status, &text)),
            }
        })
        .await
    }

    async fn update_instance(&self, request: &UpdateRequest) -> Result<UpdateResponse, BrokerError> {
        self.traced(CallKind::Update, async {
            let body = UpdateBody {
                service_id: &request.service_id,
                plan_id: request.plan_id.as_deref(),
                parameters: request.parameters.as_ref(),
                context: &request.context,
                previous_values: request
                    .previous_plan_id
                    .as_deref()
                    .map(|plan_id| PreviousValues { plan_id }),
            };
            let path = format!("/v2/service_instances/{}", request.instance_id);
            let (status, text) = self
                .send(
                    self.make_request(Method::PATCH, &path, request.originating_identity.as_ref())
                        .query(accepts_incomplete(true))
                        .json(&body),
                )
                .await?;
            match status {
                StatusCode::OK => {
                    let parsed: AsyncOperationBody = parse_body(&text)?;
                    Ok(UpdateResponse::Completed {
                        dashboard_url: parsed.dashboard_url,
                    })
                }
                StatusCode::ACCEPTED => {
                    let parsed: AsyncOperationBody = parse_body(&text)?;
                    Ok(UpdateResponse::InProgress {
                        operation: parsed.operation,
                    })
                }
                _ => Err(handle_error_response(status, &text)),
            }
        })
        .await
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError> {
        self.traced(CallKind::Deprovision, async {
            let path = format!("/v2/service_instances/{}", request.instance_id);
            let (status, text) = self
                .send(
                    self.make_request(Method::DELETE, &path, request.originating_identity.as_ref())
                        .query(accepts_incomplete(true))
                        .query(&[
                            ("service_id", request.service_id.as_str()),
                            ("plan_id", request.plan_id.as_str()),
                        ]),
                )
                .await?;
            match status {
                StatusCode::OK | StatusCode::GONE => Ok(DeprovisionResponse::Completed),
                StatusCode::ACCEPTED => {
                    let parsed: AsyncOperationBody = parse_body(&text)?;
                    Ok(DeprovisionResponse::InProgress {
                        operation: parsed.operation,
                    })
                }
                _ => Err(handle_error_response(status, &text)),
            }
        })
        .await
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        self.traced(CallKind::PollInstance, async {
            let path = format!(
                "/v2/service_instances/{}/last_operation",
                request.instance_id
            );
            let query = last_operation_query(
                request.service_id.as_ref(),
                request.plan_id.as_ref(),
                request.operation.as_ref(),
            );
            let (status, text) = self
                .send(
                    self.make_request(Method::GET, &path, request.originating_identity.as_ref())
                        .query(&query),
                )
                .await?;
            parse_last_operation(status, &text)
        })
        .await
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError> {
        self.traced(CallKind::Bind, async {
            let body = BindBody {
                service_id: &request.service_id,
                plan_id: &request.plan_id,
                parameters: request.parameters.as_ref(),
                context: &request.context,
            };
            let path = format!(
                "/v2/service_instances/{}/service_bindings/{}",
                request.instance_id, request.binding_id
            );
            let (status, text) = self
                .send(
                    self.make_request(Method::PUT, &path, request.originating_identity.as_ref())
                        .query(accepts_incomplete(request.accepts_incomplete))
                        .json(&body),
                )
                .await?;
            match status {
                StatusCode::OK | StatusCode::CREATED => {
                    let parsed: BindingBody = parse_body(&text)?;
                    Ok(BindResponse::Completed {
                        credentials: parsed.credentials.unwrap_or_default(),
                    })
                }
                StatusCode::ACCEPTED if request.accepts_incomplete => {
                    let parsed: BindingBody = parse_body(&text)?;
                    Ok(BindResponse::InProgress {
                        operation: parsed.operation,
                    })
                }
                StatusCode::ACCEPTED => Err(BrokerError::AsyncNotSupported),
                _ => Err(handle_error_response(status, &text)),
            }
        })
        .await
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, BrokerError> {
        self.traced(CallKind::Unbind, async {
            let path = format!(
                "/v2/service_instances/{}/service_bindings/{}",
                request.instance_id, request.binding_id
            );
            let (status, text) = self
                .send(
                    self.make_request(Method::DELETE, &path, request.originating_identity.as_ref())
                        .query(accepts_incomplete(request.accepts_incomplete))
                        .query(&[
                            ("service_id", request.service_id.as_str()),
                            ("plan_id", request.plan_id.as_str()),
                        ]),
                )
                .await?;
            match status {
                StatusCode::OK | StatusCode::GONE => Ok(UnbindResponse::Completed),
                StatusCode::ACCEPTED if request.accepts_incomplete => {
                    let parsed: AsyncOperationBody = parse_body(&text)?;
                    Ok(UnbindResponse::InProgress {
                        operation: parsed.operation,
                    })
                }
                StatusCode::ACCEPTED => Err(BrokerError::AsyncNotSupported),
                _ => Err(handle_error_response(status, &text)),
            }
        })
        .await
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        self.traced(CallKind::PollBinding, async {
            let path = format!(
                "/v2/service_instances/{}/service_bindings/{}/last_operation",
                request.instance_id, request.binding_id
            );
            let query = last_operation_query(
                request.service_id.as_ref(),
                request.plan_id.as_ref(),
                request.operation.as_ref(),
            );
            let (status, text) = self
                .send(
                    self.make_request(Method::GET, &path, request.originating_identity.as_ref())
                        .query(&query),
                )
                .await?;
            parse_last_operation(status, &text)
        })
        .await
    }

    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, BrokerError> {
        self.traced(CallKind::GetBinding, async {
            let path = format!(
                "/v2/service_instances/{}/service_bindings/{}",
                request.instance_id, request.binding_id
            );
            let (status, text) = self
                .send(self.make_request(Method::GET, &path, None))
                .await?;
            if status == StatusCode::OK {
                let parsed: BindingBody = parse_body(&text)?;
                Ok(GetBindingResponse {
                    credentials: parsed.credentials.unwrap_or_default(),
                })
            } else {
                Err(handle_error_response(status, &text))
            }
        })
        .await
    }
}
