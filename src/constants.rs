//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Finalizer placed on brokers, instances and bindings so broker-side cleanup
/// runs before the record disappears
pub const FINALIZER: &str = "servicecatalog.octopilot.io/controller";

/// Field manager / component name used in logs and patches
pub const CONTROLLER_NAME: &str = "service-catalog-controller";

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default exponential backoff starting value for failed reconciles (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value for failed reconciles (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Default first delay between async last-operation polls (milliseconds)
pub const DEFAULT_POLL_INTERVAL_START_MS: u64 = 1000;

/// Default cap on the delay between async last-operation polls (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MAX_MS: u64 = 60_000;

/// Default timeout applied to every broker call (seconds)
pub const DEFAULT_BROKER_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default resync period for brokers with the `Always` relist behavior (seconds)
pub const DEFAULT_BROKER_RESYNC_INTERVAL_SECS: u64 = 300;

/// Default relist duration for brokers with the `Duration` relist behavior
pub const DEFAULT_RELIST_DURATION: &str = "15m";

/// Default delay before restarting a watch stream after an error (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default worker counts per resource kind
pub const DEFAULT_BROKER_WORKERS: usize = 2;
pub const DEFAULT_CATALOG_WORKERS: usize = 2;
pub const DEFAULT_INSTANCE_WORKERS: usize = 5;
pub const DEFAULT_BINDING_WORKERS: usize = 5;

/// Open Service Broker API version sent in `X-Broker-API-Version`
pub const DEFAULT_OSB_API_VERSION: &str = "2.13";

/// Header carrying the originating identity envelope
pub const ORIGINATING_IDENTITY_HEADER: &str = "X-Broker-API-Originating-Identity";

/// Platform name used in the originating identity header
pub const ORIGINATING_IDENTITY_PLATFORM: &str = "kubernetes";

/// Secret keys read for broker basic auth
pub const BASIC_AUTH_USERNAME_KEY: &str = "username";
pub const BASIC_AUTH_PASSWORD_KEY: &str = "password";

/// Secret key read for broker bearer auth
pub const BEARER_TOKEN_KEY: &str = "token";
