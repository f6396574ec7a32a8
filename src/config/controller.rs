//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// The struct is built once at startup and handed to every component that needs it,
/// including the switches that gate optional protocol features.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Port for `/metrics`, `/healthz` and `/readyz`
    pub metrics_port: u16,
    /// Worker loops for the broker queue
    pub broker_workers: usize,
    /// Worker loops for the class/plan garbage-collection queue
    pub catalog_workers: usize,
    /// Worker loops for the instance queue
    pub instance_workers: usize,
    /// Worker loops for the binding queue
    pub binding_workers: usize,
    /// First retry delay after a failed reconcile (milliseconds)
    pub backoff_start_ms: u64,
    /// Cap on the retry delay after repeated failures (milliseconds)
    pub backoff_max_ms: u64,
    /// First delay between last-operation polls (milliseconds)
    pub poll_interval_start_ms: u64,
    /// Cap on the delay between last-operation polls (milliseconds)
    pub poll_interval_max_ms: u64,
    /// Timeout applied to every broker call (seconds)
    pub broker_request_timeout_secs: u64,
    /// Resync period for brokers that relist on every reconcile (seconds)
    pub broker_resync_interval_secs: u64,
    /// Allow brokers to answer bind/unbind asynchronously
    pub async_binding_operations: bool,
    /// Send the `X-Broker-API-Originating-Identity` header
    pub originating_identity: bool,
    /// Value of the `X-Broker-API-Version` header
    pub osb_api_version: String,
    /// Cluster identifier sent as the organization/space GUID
    pub cluster_id: String,
    /// Delay before a failed watch stream is restarted (seconds)
    pub watch_restart_delay_secs: u64,
    /// Log format (json, text)
    pub log_format: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            broker_workers: DEFAULT_BROKER_WORKERS,
            catalog_workers: DEFAULT_CATALOG_WORKERS,
            instance_workers: DEFAULT_INSTANCE_WORKERS,
            binding_workers: DEFAULT_BINDING_WORKERS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            poll_interval_start_ms: DEFAULT_POLL_INTERVAL_START_MS,
            poll_interval_max_ms: DEFAULT_POLL_INTERVAL_MAX_MS,
            broker_request_timeout_secs: DEFAULT_BROKER_REQUEST_TIMEOUT_SECS,
            broker_resync_interval_secs: DEFAULT_BROKER_RESYNC_INTERVAL_SECS,
            async_binding_operations: false,
            originating_identity: true,
            osb_api_version: DEFAULT_OSB_API_VERSION.to_string(),
            cluster_id: uuid::Uuid::new_v4().to_string(),
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            log_format: "text".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            metrics_port: env_var_or_default("METRICS_PORT", defaults.metrics_port),
            broker_workers: env_var_or_default("BROKER_WORKERS", defaults.broker_workers),
            catalog_workers: env_var_or_default("CATALOG_WORKERS", defaults.catalog_workers),
            instance_workers: env_var_or_default("INSTANCE_WORKERS", defaults.instance_workers),
            binding_workers: env_var_or_default("BINDING_WORKERS", defaults.binding_workers),
            backoff_start_ms: env_var_or_default("BACKOFF_START_MS", defaults.backoff_start_ms),
            backoff_max_ms: env_var_or_default("BACKOFF_MAX_MS", defaults.backoff_max_ms),
            poll_interval_start_ms: env_var_or_default(
                "POLL_INTERVAL_START_MS",
                defaults.poll_interval_start_ms,
            ),
            poll_interval_max_ms: env_var_or_default(
                "POLL_INTERVAL_MAX_MS",
                defaults.poll_interval_max_ms,
            ),
            broker_request_timeout_secs: env_var_or_default(
                "BROKER_REQUEST_TIMEOUT_SECS",
                defaults.broker_request_timeout_secs,
            ),
            broker_resync_interval_secs: env_var_or_default(
                "BROKER_RESYNC_INTERVAL_SECS",
                defaults.broker_resync_interval_secs,
            ),
            async_binding_operations: env_var_or_default_bool(
                "ASYNC_BINDING_OPERATIONS",
                defaults.async_binding_operations,
            ),
            originating_identity: env_var_or_default_bool(
                "ORIGINATING_IDENTITY",
                defaults.originating_identity,
            ),
            osb_api_version: env_var_or_default_str("OSB_API_VERSION", &defaults.osb_api_version),
            cluster_id: env_var_or_default_str("CLUSTER_ID", &defaults.cluster_id),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                defaults.watch_restart_delay_secs,
            ),
            log_format: env_var_or_default_str("LOG_FORMAT", &defaults.log_format),
        }
    }

    /// Get backoff start duration
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    /// Get backoff max duration
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Get first poll delay
    pub fn poll_interval_start(&self) -> Duration {
        Duration::from_millis(self.poll_interval_start_ms)
    }

    /// Get poll delay cap
    pub fn poll_interval_max(&self) -> Duration {
        Duration::from_millis(self.poll_interval_max_ms)
    }

    /// Get broker call timeout
    pub fn broker_request_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_request_timeout_secs)
    }

    /// Get resync period for `Always` relist brokers
    pub fn broker_resync_interval(&self) -> Duration {
        Duration::from_secs(self.broker_resync_interval_secs)
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    let v_lower = value.to_lowercase();
    v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_async_binding() {
        let config = ControllerConfig::default();
        assert!(!config.async_binding_operations);
        assert!(config.originating_identity);
        assert_eq!(config.osb_api_version, "2.13");
        assert_eq!(config.backoff_start_duration(), Duration::from_secs(1));
        assert_eq!(config.backoff_max_duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_bool_accepts_common_spellings() {
        for value in ["true", "TRUE", "1", "yes", "On"] {
            assert!(parse_bool(value), "{value} should parse as true");
        }
        for value in ["false", "0", "no", "off", ""] {
            assert!(!parse_bool(value), "{value} should parse as false");
        }
    }

    #[test]
    fn test_env_var_or_default_falls_back_on_garbage() {
        assert_eq!(
            env_var_or_default("SERVICE_CATALOG_TEST_UNSET_VARIABLE", 7_u64),
            7
        );
    }
}
