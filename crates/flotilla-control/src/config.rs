//! Configuration for flotilla-control.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Document store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Remote task broker configuration.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Eventual-consistency polling.
    #[serde(default)]
    pub consistency: ConsistencyConfig,

    /// Deployment environment behaviour.
    #[serde(default)]
    pub environment: EnvironmentConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `control.toml` in the current directory (if present)
    /// 3. Environment variables with `FLOTILLA_CONTROL_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("control.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FLOTILLA_CONTROL_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// Which store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process maps; state is lost on exit.
    #[default]
    Memory,
    /// PostgreSQL document table.
    Postgres,
}

/// Document store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StoreBackend,

    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "postgres://localhost/flotilla".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Remote task broker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Base URL for the broker HTTP API.
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_broker_timeout_secs")]
    pub timeout_secs: u64,

    /// How often to poll a task while waiting on it, in milliseconds.
    #[serde(default = "default_result_poll_interval_ms")]
    pub result_poll_interval_ms: u64,
}

fn default_broker_url() -> String {
    "http://localhost:8086".to_owned()
}

const fn default_broker_timeout_secs() -> u64 {
    10
}

const fn default_result_poll_interval_ms() -> u64 {
    500
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            timeout_secs: default_broker_timeout_secs(),
            result_poll_interval_ms: default_result_poll_interval_ms(),
        }
    }
}

/// Eventual-consistency polling.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsistencyConfig {
    /// Delay between polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up after this many seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_deadline_secs() -> u64 {
    30
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            deadline_secs: default_deadline_secs(),
        }
    }
}

/// Deployment environment behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    /// Task target (queue) for the environment system workflows.
    #[serde(default = "default_management_target")]
    pub management_target: String,

    /// Delay before re-checking a pending environment execution, in milliseconds.
    #[serde(default = "default_verify_retry_delay_ms")]
    pub verify_retry_delay_ms: u64,

    /// How long environment deletion may take, in seconds.
    #[serde(default = "default_deletion_timeout_secs")]
    pub deletion_timeout_secs: u64,
}

fn default_management_target() -> String {
    "management".to_owned()
}

const fn default_verify_retry_delay_ms() -> u64 {
    5000
}

const fn default_deletion_timeout_secs() -> u64 {
    300 // 5 minutes
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            management_target: default_management_target(),
            verify_retry_delay_ms: default_verify_retry_delay_ms(),
            deletion_timeout_secs: default_deletion_timeout_secs(),
        }
    }
}
