use garde::Validate;
use serde::Deserialize;
use std::time::Duration;

use crate::services::retry::RetryPolicy;

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Redis connection string. When set, consumed token nonces are tracked in
    /// Redis so single-use holds across instances.
    #[serde(default)]
    #[garde(skip)]
    pub redis_url: Option<String>,

    /// Base URL of the document conversion service
    #[garde(length(min = 1))]
    pub converter_url: String,

    /// R2 bucket name
    #[garde(length(min = 1))]
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    #[garde(length(min = 1))]
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    #[garde(length(min = 1))]
    pub r2_secret_key: String,

    /// R2 endpoint URL
    #[garde(length(min = 1))]
    pub r2_endpoint: String,

    /// HMAC key for preview tokens (base64-encoded, at least 32 bytes)
    #[garde(length(min = 1))]
    pub preview_token_secret: String,

    #[serde(default = "default_queue_capacity")]
    #[garde(range(min = 1, max = 100_000))]
    pub queue_capacity: usize,

    #[serde(default = "default_worker_count")]
    #[garde(range(min = 1, max = 64))]
    pub worker_count: usize,

    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 1, max = 50))]
    pub max_attempts: i32,

    /// Comma-separated backoff schedule; the last entry is reused once exhausted.
    #[serde(default = "default_retry_delays")]
    #[garde(length(min = 1), inner(range(max = 86_400)))]
    pub retry_delays_secs: Vec<u64>,

    #[serde(default = "default_conversion_timeout")]
    #[garde(range(min = 1))]
    pub conversion_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    #[garde(range(min = 1))]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_replay_cleanup_interval")]
    #[garde(range(min = 1))]
    pub replay_cleanup_interval_secs: u64,

    /// A processing job older than this is presumed abandoned.
    #[serde(default = "default_stale_processing")]
    #[garde(range(min = 1))]
    pub stale_processing_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_queue_capacity() -> usize {
    100
}

fn default_worker_count() -> usize {
    4
}

fn default_max_attempts() -> i32 {
    3
}

fn default_retry_delays() -> Vec<u64> {
    vec![30, 120, 600]
}

fn default_conversion_timeout() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_replay_cleanup_interval() -> u64 {
    60
}

fn default_stale_processing() -> u64 {
    900
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;

        if self.stale_processing_secs <= self.conversion_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "stale_processing_secs ({}) must exceed conversion_timeout_secs ({})",
                self.stale_processing_secs, self.conversion_timeout_secs
            )));
        }
        Ok(())
    }

    /// Runtime knobs for the queue, workers and sweeps.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            queue_capacity: self.queue_capacity,
            worker_count: self.worker_count,
            max_attempts: self.max_attempts,
            retry: RetryPolicy::from_secs(&self.retry_delays_secs),
            conversion_timeout: Duration::from_secs(self.conversion_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            replay_cleanup_interval: Duration::from_secs(self.replay_cleanup_interval_secs),
            stale_after: Duration::from_secs(self.stale_processing_secs),
        }
    }
}

/// Tuning for [`crate::services::pipeline::PreviewPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub max_attempts: i32,
    pub retry: RetryPolicy,
    pub conversion_timeout: Duration,
    pub sweep_interval: Duration,
    pub replay_cleanup_interval: Duration,
    pub stale_after: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            worker_count: default_worker_count(),
            max_attempts: default_max_attempts(),
            retry: RetryPolicy::default(),
            conversion_timeout: Duration::from_secs(default_conversion_timeout()),
            sweep_interval: Duration::from_secs(default_sweep_interval()),
            replay_cleanup_interval: Duration::from_secs(default_replay_cleanup_interval()),
            stale_after: Duration::from_secs(default_stale_processing()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
