//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: hardcoded in the serde default functions
//! 2. **Config file**: TOML file specified by the `STRATUS_CONFIG` env var
//! 3. **Environment variables**: `STRATUS_*` vars override specific fields
//!
//! The server binary additionally applies CLI flag overrides on top of the
//! loaded configuration.
//!
//! # Validation
//!
//! Configuration is validated at load time: an unusable listen address, a
//! zero interval, or a malformed region tag fails startup instead of failing
//! silently later.
//!
//! # Example
//!
//! ```toml
//! [scheduler]
//! server_name = "sched-eu-1"
//! region = "eu-west-1"
//!
//! [validation]
//! interval_minutes = 5
//! enabled = true
//!
//! [replication]
//! candidate_replicas = 1
//! backup_cache_count = 2
//! ```

use crate::store::{Region, StoreError};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address and port the scheduler API listens on. Defaults to `0.0.0.0:3456`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// TLS certificate path; TLS is enabled when both this and
    /// `private_key_path` are set.
    #[serde(default)]
    pub certificate_path: Option<String>,

    /// TLS private key path.
    #[serde(default)]
    pub private_key_path: Option<String>,

    /// Optional CA certificate for verifying node client certs.
    #[serde(default)]
    pub ca_certificate_path: Option<String>,

    /// Maximum request body size in bytes. Defaults to 1 MiB.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_listen() -> String {
    "0.0.0.0:3456".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            certificate_path: None,
            private_key_path: None,
            ca_certificate_path: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Backend store endpoints.
///
/// The URLs are opaque to the core; the store implementations chosen at
/// startup interpret them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoresConfig {
    /// Ephemeral (key-value) store URL. Empty selects the in-memory backend.
    #[serde(default)]
    pub cachedb_url: String,

    /// Persistent store URL. Empty selects the in-memory backend.
    #[serde(default)]
    pub persistentdb_url: String,
}

/// Scheduler identity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Unique name of this scheduler instance; scopes node presence rows so a
    /// second scheduler cannot clobber peer state.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Deployment region tag (validated, see [`Region`]).
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_server_name() -> String {
    "scheduler-1".to_string()
}

fn default_region() -> String {
    "default".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { server_name: default_server_name(), region: default_region() }
    }
}

/// Validation round engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Whether periodic validation rounds run. Defaults to `false`.
    #[serde(default)]
    pub enabled: bool,

    /// Minutes between rounds. Must be greater than 0. Defaults to `5`.
    #[serde(default = "default_validation_interval")]
    pub interval_minutes: u64,

    /// Maximum challenge duration handed to validators, seconds. Defaults to `10`.
    #[serde(default = "default_challenge_duration")]
    pub challenge_duration_secs: u64,
}

fn default_validation_interval() -> u64 {
    5
}

fn default_challenge_duration() -> u64 {
    10
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_validation_interval(),
            challenge_duration_secs: default_challenge_duration(),
        }
    }
}

/// Validator election settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Fraction of the online node count elected as validators. The result is
    /// rounded up with a floor of one validator whenever any candidate is
    /// online. Defaults to `0.1`.
    #[serde(default = "default_validator_ratio")]
    pub validator_ratio: f64,

    /// Minutes between elections; also the TTL of the persisted validator
    /// list. Defaults to `60`.
    #[serde(default = "default_election_interval")]
    pub interval_minutes: u64,
}

fn default_validator_ratio() -> f64 {
    0.1
}

fn default_election_interval() -> u64 {
    60
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            validator_ratio: default_validator_ratio(),
            interval_minutes: default_election_interval(),
        }
    }
}

/// Replica manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Candidate-tier replicas per carfile (the first is the root candidate
    /// edges pull from). Defaults to `1`.
    #[serde(default = "default_candidate_replicas")]
    pub candidate_replicas: u32,

    /// Replacement dispatches allowed per carfile after node-side failures.
    /// Defaults to `1`.
    #[serde(default = "default_backup_cache_count")]
    pub backup_cache_count: u32,

    /// Seconds a dispatched replica may stay silent before it is failed.
    /// Defaults to `1800`.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,

    /// Nodes at or above this disk usage percentage are skipped by selection.
    /// Defaults to `90.0`.
    #[serde(default = "default_max_disk_usage")]
    pub max_disk_usage: f64,

    /// Seconds to wait for node deletion acks before dropping replica rows of
    /// a removed carfile. Defaults to `60`.
    #[serde(default = "default_removal_grace")]
    pub removal_grace_secs: u64,
}

fn default_candidate_replicas() -> u32 {
    1
}

fn default_backup_cache_count() -> u32 {
    1
}

fn default_dispatch_timeout() -> u64 {
    1800
}

fn default_max_disk_usage() -> f64 {
    90.0
}

fn default_removal_grace() -> u64 {
    60
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            candidate_replicas: default_candidate_replicas(),
            backup_cache_count: default_backup_cache_count(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            max_disk_usage: default_max_disk_usage(),
            removal_grace_secs: default_removal_grace(),
        }
    }
}

/// Download instruction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Seconds a signed download instruction stays valid. Defaults to `60`.
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,
}

fn default_download_timeout() -> u64 {
    60
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self { timeout_secs: default_download_timeout() }
    }
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level. Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Prometheus metrics exposure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the `/metrics` endpoint is served. Defaults to `true`.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: default_metrics_enabled() }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stores: StoresConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Loads configuration from defaults, the optional file named by
    /// `STRATUS_CONFIG`, and `STRATUS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a source cannot be read or the merged
    /// configuration fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Ok(path) = std::env::var("STRATUS_CONFIG") {
            builder = builder.add_source(File::with_name(&path));
        }
        let cfg: AppConfig = builder
            .add_source(Environment::with_prefix("STRATUS").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate().map_err(|e| ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(StoreError::Invalid(format!(
                "server.listen is not a socket address: {}",
                self.server.listen
            )));
        }
        if self.validation.interval_minutes == 0 {
            return Err(StoreError::Invalid("validation.interval_minutes must be > 0".into()));
        }
        if self.election.interval_minutes == 0 {
            return Err(StoreError::Invalid("election.interval_minutes must be > 0".into()));
        }
        if !(self.election.validator_ratio > 0.0 && self.election.validator_ratio <= 1.0) {
            return Err(StoreError::Invalid(
                "election.validator_ratio must be in (0, 1]".into(),
            ));
        }
        if self.scheduler.server_name.trim().is_empty() {
            return Err(StoreError::Invalid("scheduler.server_name must not be empty".into()));
        }
        self.region()?;
        if self.server.certificate_path.is_some() != self.server.private_key_path.is_some() {
            return Err(StoreError::Invalid(
                "TLS requires both certificate_path and private_key_path".into(),
            ));
        }
        Ok(())
    }

    /// The validated region tag.
    pub fn region(&self) -> Result<Region, StoreError> {
        Region::parse(&self.scheduler.region)
    }

    #[must_use]
    pub fn validation_interval(&self) -> Duration {
        Duration::from_secs(self.validation.interval_minutes * 60)
    }

    #[must_use]
    pub fn election_interval(&self) -> Duration {
        Duration::from_secs(self.election.interval_minutes * 60)
    }

    #[must_use]
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.dispatch_timeout_secs)
    }
}
