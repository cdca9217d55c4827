use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Ops listener bind address for /health and /metrics.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue and workspace leases
    pub redis_url: String,

    /// Address classification provider endpoint
    pub classifier_url: String,

    /// Bearer token for the classification provider
    pub classifier_api_token: String,

    #[serde(default = "default_classifier_timeout_ms")]
    pub classifier_timeout_ms: u64,

    /// Addresses between progress checkpoints
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// Fixed delay before each classification call
    #[serde(default = "default_address_delay_ms")]
    pub address_delay_ms: u64,

    /// Infrastructure failures tolerated before a job is failed
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Workspace lease lifetime, refreshed at every checkpoint
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Redelivery delay when another worker holds the workspace lease
    #[serde(default = "default_lease_busy_delay_ms")]
    pub lease_busy_delay_ms: u64,

    /// Idle sleep between empty queue polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A processing job with no checkpoint for this long is considered stuck
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    /// Requeues attempted by the reaper before a stuck job is failed
    #[serde(default = "default_max_reaps")]
    pub max_reaps: i32,

    /// Completed/failed queue messages kept for inspection
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_classifier_timeout_ms() -> u64 {
    10_000
}

fn default_checkpoint_interval() -> u32 {
    10
}

fn default_address_delay_ms() -> u64 {
    100
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_lease_busy_delay_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_stale_after_secs() -> u64 {
    600
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_max_reaps() -> i32 {
    3
}

fn default_history_retention() -> usize {
    1_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            checkpoint_interval: self.checkpoint_interval.max(1),
            address_delay: Duration::from_millis(self.address_delay_ms),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            lease_busy_delay: Duration::from_millis(self.lease_busy_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stale_after: Duration::from_secs(self.stale_after_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
            max_reaps: self.max_reaps,
        }
    }
}

/// Tunables for the bulk job worker and reaper.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub checkpoint_interval: u32,
    pub address_delay: Duration,
    pub max_retries: i32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub lease_ttl: Duration,
    pub lease_busy_delay: Duration,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub reaper_interval: Duration,
    pub max_reaps: i32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            address_delay: Duration::from_millis(default_address_delay_ms()),
            max_retries: default_max_retries(),
            retry_base_delay: Duration::from_millis(default_retry_base_delay_ms()),
            retry_max_delay: Duration::from_millis(default_retry_max_delay_ms()),
            lease_ttl: Duration::from_secs(default_lease_ttl_secs()),
            lease_busy_delay: Duration::from_millis(default_lease_busy_delay_ms()),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            stale_after: Duration::from_secs(default_stale_after_secs()),
            reaper_interval: Duration::from_secs(default_reaper_interval_secs()),
            max_reaps: default_max_reaps(),
        }
    }
}
