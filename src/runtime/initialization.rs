//! # Initialization
//!
//! Process setup: rustls provider, tracing, metrics, the HTTP server, the
//! Kubernetes client and the shared reconcile [`Context`].

use crate::broker::{BrokerClientManager, HttpBrokerClientFactory};
use crate::config::ControllerConfig;
use crate::controller::server::{bind, serve, ServerState};
use crate::controller::Context;
use crate::observability;
use crate::store::Stores;
use anyhow::{Context as _, Result};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Everything the watch loop needs
#[derive(Debug)]
pub struct InitializationResult {
    pub ctx: Arc<Context>,
    pub server_state: Arc<ServerState>,
}

/// Install the global subscriber; `LOG_FORMAT=json` switches to JSON lines
pub fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("service_catalog_controller=info"));
    let result = if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    if let Err(e) = result {
        warn!("Tracing subscriber already initialized: {}", e);
    }
}

/// Set up the process and build the reconcile context against the cluster
///
/// # Errors
///
/// Fails when metrics cannot be registered, the probe port cannot be bound or
/// no Kubernetes client can be built.
pub async fn initialize(config: ControllerConfig) -> Result<InitializationResult> {
    // Must precede every TLS connection (kube client and broker clients)
    let provider_installed = rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok();

    init_tracing(&config.log_format);
    if !provider_installed {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting Service Catalog Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
    info!(
        cluster_id = %config.cluster_id,
        osb_api_version = %config.osb_api_version,
        async_binding_operations = config.async_binding_operations,
        originating_identity = config.originating_identity,
        "configuration loaded"
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let listener = bind(config.metrics_port)
        .await
        .context("Failed to bind metrics port")?;
    let server_state_for_server = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = serve(listener, server_state_for_server).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let stores = Stores::kube(&client);

    let clients = Arc::new(BrokerClientManager::new(
        Arc::new(HttpBrokerClientFactory),
        Arc::clone(&stores.secrets),
        config.osb_api_version.clone(),
        config.broker_request_timeout(),
    ));
    let ctx = Arc::new(Context::new(stores, clients, config));

    info!("Controller initialized, starting watch loop...");
    Ok(InitializationResult { ctx, server_state })
}
