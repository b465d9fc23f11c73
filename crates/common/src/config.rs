//! Configuration structures for WorkerBridge
//!
//! This module defines the configuration consumed by the worker registry,
//! the request tracker and the maintenance loop. Configurations are loaded
//! from YAML files and can be overridden by environment variables.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding a comma-separated worker token list
pub const WORKER_TOKENS_ENV: &str = "WORKER_TOKENS";

/// Top-level configuration for the coordinator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Worker pool settings
    #[serde(default)]
    pub worker_settings: WorkerSettings,

    /// Request tracking settings
    #[serde(default)]
    pub queue_settings: QueueSettings,

    /// Sweeper cadence and result delivery bounds
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Maximum number of concurrently registered workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Seconds without a heartbeat before a worker counts as unhealthy
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_seconds: u64,

    /// Reject workers whose token is not accepted
    #[serde(default = "default_require_authentication")]
    pub require_authentication: bool,

    /// Static token list, used when `WORKER_TOKENS` is unset
    #[serde(default)]
    pub valid_tokens: Vec<String>,
}

/// Request tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Timeout applied to requests that do not carry their own
    #[serde(default = "default_max_wait")]
    pub max_wait_seconds: u64,

    /// Reject requests outright when no worker is idle.
    /// Reported in stats; there is no backlog to fall back on.
    #[serde(default = "default_reject_when_no_workers")]
    pub reject_when_no_workers: bool,
}

/// Maintenance loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Period of the unhealthy-worker sweep
    #[serde(default = "default_worker_sweep_interval")]
    pub worker_sweep_interval_secs: u64,

    /// Period of the expired-request sweep
    #[serde(default = "default_request_sweep_interval")]
    pub request_sweep_interval_secs: u64,

    /// Capacity of each request's result channel
    #[serde(default = "default_result_buffer_size")]
    pub result_buffer_size: usize,

    /// Upper bound on a single push into a result channel
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_ms: u64,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Expose Prometheus text and log final stats. Collection always runs.
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

/// Default value functions
fn default_max_workers() -> usize {
    10
}

fn default_worker_timeout() -> u64 {
    120
}

fn default_require_authentication() -> bool {
    true
}

fn default_max_wait() -> u64 {
    60
}

fn default_reject_when_no_workers() -> bool {
    true
}

fn default_worker_sweep_interval() -> u64 {
    30
}

fn default_request_sweep_interval() -> u64 {
    10
}

fn default_result_buffer_size() -> usize {
    64
}

fn default_delivery_timeout() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker_timeout_seconds: default_worker_timeout(),
            require_authentication: default_require_authentication(),
            valid_tokens: Vec::new(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_wait_seconds: default_max_wait(),
            reject_when_no_workers: default_reject_when_no_workers(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            worker_sweep_interval_secs: default_worker_sweep_interval(),
            request_sweep_interval_secs: default_request_sweep_interval(),
            result_buffer_size: default_result_buffer_size(),
            delivery_timeout_ms: default_delivery_timeout(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
            structured_logging: false,
        }
    }
}

impl WorkerSettings {
    /// Health threshold as Duration
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_seconds)
    }
}

impl QueueSettings {
    /// Default per-request timeout as Duration
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }
}

impl MaintenanceConfig {
    pub fn worker_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.worker_sweep_interval_secs)
    }

    pub fn request_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.request_sweep_interval_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl BridgeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| BridgeError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: BridgeConfig = serde_yaml::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Build configuration from defaults and environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = BridgeConfig::default();

        if let Ok(value) = std::env::var("WORKERBRIDGE_MAX_WORKERS") {
            config.worker_settings.max_workers = value
                .parse()
                .map_err(|_| BridgeError::config("Invalid WORKERBRIDGE_MAX_WORKERS"))?;
        }

        if let Ok(value) = std::env::var("WORKERBRIDGE_WORKER_TIMEOUT") {
            config.worker_settings.worker_timeout_seconds = value
                .parse()
                .map_err(|_| BridgeError::config("Invalid WORKERBRIDGE_WORKER_TIMEOUT"))?;
        }

        if let Ok(value) = std::env::var("WORKERBRIDGE_MAX_WAIT") {
            config.queue_settings.max_wait_seconds = value
                .parse()
                .map_err(|_| BridgeError::config("Invalid WORKERBRIDGE_MAX_WAIT"))?;
        }

        if let Ok(value) = std::env::var("WORKERBRIDGE_REQUIRE_AUTH") {
            config.worker_settings.require_authentication = value
                .parse()
                .map_err(|_| BridgeError::config("Invalid WORKERBRIDGE_REQUIRE_AUTH"))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_settings.max_workers == 0 {
            return Err(BridgeError::config("max_workers must be at least 1"));
        }
        if self.worker_settings.worker_timeout_seconds == 0 {
            return Err(BridgeError::config("worker_timeout_seconds must be positive"));
        }
        if self.maintenance.result_buffer_size == 0 {
            return Err(BridgeError::config("result_buffer_size must be at least 1"));
        }
        if self.maintenance.worker_sweep_interval_secs == 0
            || self.maintenance.request_sweep_interval_secs == 0
        {
            return Err(BridgeError::config("sweep intervals must be positive"));
        }
        Ok(())
    }
}
