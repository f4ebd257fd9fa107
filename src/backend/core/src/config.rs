//! Configuration management.
//!
//! Configuration is read once at startup from an optional file plus
//! `SUBMITQ__SECTION__KEY` environment variables, then validated. An invalid
//! configuration is fatal at startup, never at first use.

use serde::Deserialize;

use crate::error::{Result, SubmitqError};
use crate::jobs::BackoffType;
use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Submit job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Ledger gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Queue behaviour shared by the facade, the worker pool and the scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Backoff type for retrying failed submit jobs
    #[serde(default)]
    pub backoff_type: BackoffType,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,

    /// Total number of attempts for a submit job
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Maximum number of submit jobs processed in parallel, per pool (per
    /// process). Pools sharing a store do not share this bound.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of completed submit jobs to keep
    #[serde(default = "default_max_retained")]
    pub max_completed_retained: usize,

    /// Number of failed submit jobs to keep
    #[serde(default = "default_max_retained")]
    pub max_failed_retained: usize,

    /// Whether this process runs a scheduler. At least one process in a
    /// deployment must, or delayed retries never resume.
    #[serde(default = "default_scheduler_enabled")]
    pub scheduler_enabled: bool,

    /// How long an idle worker waits before polling the store again
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval between scheduler scans for due delayed jobs
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,

    /// Age of a claim after which the scheduler releases an `active` job.
    /// Must exceed the gateway timeout.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_type: BackoffType::default(),
            backoff_delay_ms: default_backoff_delay_ms(),
            max_attempts: default_max_attempts(),
            concurrency: default_concurrency(),
            max_completed_retained: default_max_retained(),
            max_failed_retained: default_max_retained(),
            scheduler_enabled: default_scheduler_enabled(),
            poll_interval_ms: default_poll_interval_ms(),
            scheduler_interval_ms: default_scheduler_interval_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
        }
    }
}

impl QueueConfig {
    /// Check every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.backoff_delay_ms == 0 {
            return Err(SubmitqError::configuration("queue.backoff_delay_ms must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(SubmitqError::configuration("queue.max_attempts must be positive"));
        }
        if self.concurrency == 0 {
            return Err(SubmitqError::configuration("queue.concurrency must be positive"));
        }
        if self.max_completed_retained == 0 {
            return Err(SubmitqError::configuration(
                "queue.max_completed_retained must be positive",
            ));
        }
        if self.max_failed_retained == 0 {
            return Err(SubmitqError::configuration(
                "queue.max_failed_retained must be positive",
            ));
        }
        if self.poll_interval_ms == 0 || self.scheduler_interval_ms == 0 {
            return Err(SubmitqError::configuration(
                "queue.poll_interval_ms and queue.scheduler_interval_ms must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every key the job store writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Refuse to start unless Redis runs with `maxmemory-policy=noeviction`
    #[serde(default = "default_require_noeviction")]
    pub require_noeviction: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            require_noeviction: default_require_noeviction(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the ledger REST gateway
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    /// Channel the contract is deployed on
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Contract (chaincode) name
    #[serde(default = "default_contract")]
    pub contract: String,

    /// Timeout in seconds for endorsement and commit of one submission
    #[serde(default = "default_endorse_timeout_secs")]
    pub endorse_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            channel: default_channel(),
            contract: default_contract(),
            endorse_timeout_secs: default_endorse_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObservabilityConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// Default value functions
fn default_backoff_delay_ms() -> u64 { 3000 }
fn default_max_attempts() -> u32 { 5 }
fn default_concurrency() -> usize { 5 }
fn default_max_retained() -> usize { 1000 }
fn default_scheduler_enabled() -> bool { true }
fn default_poll_interval_ms() -> u64 { 250 }
fn default_scheduler_interval_ms() -> u64 { 1000 }
fn default_stall_timeout_ms() -> u64 { 300_000 }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "submitq".to_string() }
fn default_require_noeviction() -> bool { true }
fn default_gateway_url() -> String { "http://localhost:3000".to_string() }
fn default_channel() -> String { "mychannel".to_string() }
fn default_contract() -> String { "basic".to_string() }
fn default_endorse_timeout_secs() -> u64 { 30 }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(Self::environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(Self::environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        if self.redis.key_prefix.is_empty() {
            return Err(SubmitqError::configuration("redis.key_prefix must not be empty"));
        }
        if self.gateway.endorse_timeout_secs == 0 {
            return Err(SubmitqError::configuration(
                "gateway.endorse_timeout_secs must be positive",
            ));
        }
        if self.queue.stall_timeout_ms <= self.gateway.endorse_timeout_secs.saturating_mul(1000) {
            return Err(SubmitqError::configuration(
                "queue.stall_timeout_ms must exceed gateway.endorse_timeout_secs",
            ));
        }
        Ok(())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("SUBMITQ")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }
}
