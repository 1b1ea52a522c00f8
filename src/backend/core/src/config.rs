//! Configuration management.
//!
//! Values come from an optional file, then `RQ__`-prefixed environment
//! variables (`RQ__REDIS__URL`, `RQ__QUEUE__POOL_SIZE`,
//! `RQ__STORE__TIERS=redis,postgres`).

use serde::Deserialize;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::jobs::retry::RetryPolicy;

const ENV_PREFIX: &str = "RQ";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub supabase: SupabaseConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub research: ResearchConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// A persistence backend that can serve as a store tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Redis,
    Supabase,
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Tiers in preference order
    #[serde(default = "default_tiers")]
    pub tiers: Vec<StoreKind>,

    /// Append an in-process tier behind the configured ones
    #[serde(default = "default_true")]
    pub memory_fallback: bool,

    /// Deadline for a single store call
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Consecutive failures before a tier is skipped
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long a tripped tier is skipped before it is tried again
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            memory_fallback: true,
            operation_timeout: default_operation_timeout(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Namespace for every key the store writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Hosted Postgres behind a PostgREST API.
#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseConfig {
    pub url: Option<String>,

    /// Service-role key; sent as both `apikey` and bearer token
    pub service_key: Option<String>,

    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            service_key: None,
            table: default_table(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; the tier is skipped when unset
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Apply bundled migrations on connect
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout: default_connect_timeout(),
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Jobs fetched per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent research calls
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Deadline for one research call
    #[serde(default = "default_job_timeout", with = "humantime_serde")]
    pub job_timeout: Duration,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,

    /// Age after which completed and failed jobs are deleted
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// Age after which dead-letter jobs are deleted
    #[serde(default = "default_dead_letter_retention", with = "humantime_serde")]
    pub dead_letter_retention: Duration,

    /// Capacity of the job event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Extra time past `job_timeout` before a `processing` job with no
    /// update is treated as abandoned
    #[serde(default = "default_stale_grace", with = "humantime_serde")]
    pub stale_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            pool_size: default_pool_size(),
            job_timeout: default_job_timeout(),
            max_attempts: default_max_attempts(),
            max_query_length: default_max_query_length(),
            retention: default_retention(),
            dead_letter_retention: default_dead_letter_retention(),
            event_buffer: default_event_buffer(),
            stale_grace: default_stale_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// How often abandoned `processing` jobs are looked for
    #[serde(default = "default_recovery_interval", with = "humantime_serde")]
    pub recovery_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: default_poll_interval(),
            cleanup_interval: default_cleanup_interval(),
            recovery_interval: default_recovery_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResearchConfig {
    #[serde(default = "default_research_endpoint")]
    pub endpoint: String,

    pub api_key: Option<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_research_endpoint(),
            api_key: None,
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            otlp_endpoint: None,
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_true() -> bool { true }
fn default_tiers() -> Vec<StoreKind> { vec![StoreKind::Redis, StoreKind::Supabase, StoreKind::Postgres] }
fn default_operation_timeout() -> Duration { Duration::from_secs(5) }
fn default_failure_threshold() -> u32 { 3 }
fn default_recovery_timeout() -> Duration { Duration::from_secs(30) }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "rq".to_string() }
fn default_table() -> String { "research_jobs".to_string() }
fn default_request_timeout() -> Duration { Duration::from_secs(10) }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> Duration { Duration::from_secs(5) }
fn default_batch_size() -> usize { 10 }
fn default_pool_size() -> usize { 4 }
fn default_job_timeout() -> Duration { Duration::from_secs(120) }
fn default_max_attempts() -> u32 { 3 }
fn default_max_query_length() -> usize { 1000 }
fn default_retention() -> Duration { Duration::from_secs(7 * 24 * 60 * 60) }
fn default_dead_letter_retention() -> Duration { Duration::from_secs(30 * 24 * 60 * 60) }
fn default_event_buffer() -> usize { 1024 }
fn default_stale_grace() -> Duration { Duration::from_secs(60) }
fn default_poll_interval() -> Duration { Duration::from_secs(2) }
fn default_cleanup_interval() -> Duration { Duration::from_secs(60 * 60) }
fn default_recovery_interval() -> Duration { Duration::from_secs(60) }
fn default_research_endpoint() -> String { "http://localhost:8000/api/v1/research".to_string() }
fn default_user_agent() -> String { format!("research-queue/{}", env!("CARGO_PKG_VERSION")) }
fn default_log_level() -> String { "info".to_string() }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.batch_size == 0 {
            return Err(QueueError::configuration("queue.batch_size must be at least 1"));
        }
        if self.queue.pool_size == 0 {
            return Err(QueueError::configuration("queue.pool_size must be at least 1"));
        }
        if self.queue.max_attempts == 0 {
            return Err(QueueError::configuration("queue.max_attempts must be at least 1"));
        }
        if self.queue.max_query_length == 0 {
            return Err(QueueError::configuration("queue.max_query_length must be at least 1"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(QueueError::configuration("retry.max_delay must not be below retry.base_delay"));
        }
        let scheduler = &self.scheduler;
        if scheduler.poll_interval.is_zero()
            || scheduler.cleanup_interval.is_zero()
            || scheduler.recovery_interval.is_zero()
        {
            return Err(QueueError::configuration("scheduler intervals must be non-zero"));
        }
        if self.store.tiers.is_empty() && !self.store.memory_fallback {
            return Err(QueueError::configuration("at least one store tier is required"));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("store.tiers")
}
