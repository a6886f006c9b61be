use serde::Deserialize;
use std::time::Duration;

use crate::models::queue::DailyAt;
use crate::pipeline::{PipelineConfig, SchedulerMode};

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string. Only needed in broker mode.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Cloudflare account ID
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    pub cf_api_token: String,

    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    /// HS256 secret for caller tokens
    pub jwt_secret: String,

    #[serde(default)]
    pub scheduler_mode: SchedulerMode,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// Unset: a retried job is re-admitted on the next polling tick.
    #[serde(default)]
    pub poll_retry_backoff_secs: Option<u64>,

    #[serde(default = "default_job_ttl_hours")]
    pub job_ttl_hours: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    #[serde(default = "default_analysis_timeout_secs")]
    pub analysis_timeout_secs: u64,

    #[serde(default)]
    pub poll_analysis_timeout_secs: Option<u64>,

    #[serde(default = "default_cleanup_hour")]
    pub cleanup_hour: u32,

    #[serde(default)]
    pub cleanup_minute: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_vision_model() -> String {
    "@cf/llava-hf/llava-1.5-7b-hf".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_max_retries() -> i32 {
    3
}

fn default_job_ttl_hours() -> u64 {
    24
}

fn default_retention_days() -> u64 {
    7
}

fn default_analysis_timeout_secs() -> u64 {
    60
}

fn default_cleanup_hour() -> u32 {
    3
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] envy::Error),

    #[error("cleanup time {hour:02}:{minute:02} is not a valid time of day")]
    CleanupTime { hour: u32, minute: u32 },

    #[error("MAX_CONCURRENT_JOBS must be at least 1")]
    NoConcurrency,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn pipeline(&self) -> Result<PipelineConfig, ConfigError> {
        let cleanup_at = DailyAt::new(self.cleanup_hour, self.cleanup_minute).ok_or(ConfigError::CleanupTime {
            hour: self.cleanup_hour,
            minute: self.cleanup_minute,
        })?;
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::NoConcurrency);
        }

        Ok(PipelineConfig {
            mode: self.scheduler_mode,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_concurrent_jobs: self.max_concurrent_jobs,
            max_retries: self.max_retries,
            poll_retry_backoff: self.poll_retry_backoff_secs.map(Duration::from_secs),
            job_ttl: (self.job_ttl_hours > 0).then(|| Duration::from_secs(self.job_ttl_hours * 60 * 60)),
            retention: Duration::from_secs(self.retention_days * 24 * 60 * 60),
            analysis_timeout: Duration::from_secs(self.analysis_timeout_secs),
            poll_analysis_timeout: self.poll_analysis_timeout_secs.map(Duration::from_secs),
            cleanup_at,
        })
    }
}
