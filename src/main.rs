//! # Service Catalog Controller
//!
//! Kubernetes controller that provisions and binds Open Service Broker services.
//!
//! 1. **Brokers** - fetches each ServiceBroker's catalog and materializes it as
//!    ServiceClass and ServicePlan records
//! 2. **Instances** - provisions, updates and deprovisions ServiceInstances
//! 3. **Bindings** - binds ServiceBindings and writes the credentials to a Secret
//!
//! Configuration comes from environment variables; the flags below override them.

use anyhow::Result;
use clap::Parser;
use service_catalog_controller::config::ControllerConfig;
use service_catalog_controller::runtime;

#[derive(Debug, Parser)]
#[command(name = "service-catalog-controller", version, about)]
struct Cli {
    /// Port for /metrics, /healthz and /readyz
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Cluster identifier sent to brokers as the organization GUID
    #[arg(long)]
    cluster_id: Option<String>,

    /// Log output format (`text` or `json`)
    #[arg(long)]
    log_format: Option<String>,

    /// Allow brokers to complete binds and unbinds asynchronously
    #[arg(long)]
    async_binding_operations: Option<bool>,
}

impl Cli {
    fn apply(self, config: &mut ControllerConfig) {
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(cluster_id) = self.cluster_id {
            config.cluster_id = cluster_id;
        }
        if let Some(log_format) = self.log_format {
            config.log_format = log_format;
        }
        if let Some(enabled) = self.async_binding_operations {
            config.async_binding_operations = enabled;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = ControllerConfig::from_env();
    Cli::parse().apply(&mut config);

    let initialized = runtime::initialize(config).await?;
    runtime::run(initialized).await
}
