//! Asynchronous analysis pipeline: job lifecycle, the two schedulers that
//! admit jobs, the shared worker, and queue administration.

pub mod admin;
pub mod broker;
pub mod classifier;
pub mod handlers;
pub mod limiter;
pub mod maintenance;
pub mod memory;
pub mod polling;
pub mod retry;
pub mod store;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::sync::watch;

use self::admin::{AdminError, BrokerAdmin, QueueAdmin, StoreAdmin};
use self::broker::{Broker, BrokerError, BrokerScheduler, TIMEOUT_GRACE};
use self::handlers::{AnalysisHandler, CleanupHandler};
use self::maintenance::MaintenanceLoop;
use self::polling::PollingScheduler;
use self::retry::{RetryPolicy, MAX_RETRIES};
use self::store::{JobStore, StoreError};
use self::worker::Worker;
use crate::models::job::{AnalysisJob, NewAnalysisJob};
use crate::models::queue::{DailyAt, QueueName, SubscriptionTier};
use crate::services::meals::MealRecorder;
use crate::services::vision::VisionAnalyzer;

/// Decides when and which jobs run. Both implementations share the [`Worker`].
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn mode(&self) -> SchedulerMode;

    /// Make a freshly created pending job eligible to run.
    async fn admit(&self, job: &AnalysisJob, tier: SubscriptionTier) -> Result<(), SchedulerError>;

    async fn admit_batch(&self, jobs: &[AnalysisJob], tier: SubscriptionTier) -> Result<(), SchedulerError>;

    /// Run until `shutdown` becomes true, then wait (bounded) for in-flight work.
    async fn run(&self, shutdown: watch::Receiver<bool>);
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SchedulerMode {
    #[default]
    Polling,
    Broker,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("broker mode requires a broker connection")]
    BrokerRequired,
}

/// Tunables for the pipeline, usually derived from `AppConfig::pipeline`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: SchedulerMode,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub max_retries: i32,
    /// Base of the polling path's inter-retry delay; `None` re-admits on the next tick.
    pub poll_retry_backoff: Option<Duration>,
    /// Sets `expires_at` on new jobs.
    pub job_ttl: Option<Duration>,
    /// Completed jobs older than this are deleted by the cleanup routine.
    pub retention: Duration,
    /// Per-task ceiling on the broker path.
    pub analysis_timeout: Duration,
    pub poll_analysis_timeout: Option<Duration>,
    /// Cleanup time used when no schedule has been stored yet.
    pub cleanup_at: DailyAt,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::Polling,
            poll_interval: Duration::from_secs(2),
            max_concurrent_jobs: 3,
            max_retries: MAX_RETRIES,
            poll_retry_backoff: None,
            job_ttl: Some(Duration::from_secs(24 * 60 * 60)),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            analysis_timeout: Duration::from_secs(60),
            poll_analysis_timeout: None,
            cleanup_at: DailyAt { hour: 3, minute: 0 },
        }
    }
}

/// The assembled pipeline: a job store, the configured scheduler and the
/// matching administration surface.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn JobStore>,
    scheduler: Arc<dyn Scheduler>,
    admin: Arc<dyn QueueAdmin>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn JobStore>,
        analyzer: Arc<dyn VisionAnalyzer>,
        meals: Arc<dyn MealRecorder>,
        broker: Option<Arc<dyn Broker>>,
    ) -> Result<Self, SchedulerError> {
        let worker = Worker::new(
            Arc::clone(&store),
            analyzer,
            meals,
            RetryPolicy::new(config.max_retries),
        );

        let (scheduler, admin): (Arc<dyn Scheduler>, Arc<dyn QueueAdmin>) = match config.mode {
            SchedulerMode::Polling => {
                let worker = worker.with_attempt_timeout(config.poll_analysis_timeout);
                let polling = PollingScheduler::new(worker, config.max_concurrent_jobs, config.poll_interval)
                    .with_retry_backoff(config.poll_retry_backoff);
                let admin = StoreAdmin::new(Arc::clone(&store)).with_retry_backoff(config.poll_retry_backoff);
                (Arc::new(polling), Arc::new(admin))
            }
            SchedulerMode::Broker => {
                let broker = broker.ok_or(SchedulerError::BrokerRequired)?;
                // A redelivered job whose row outlived the task's hard limit
                // belongs to an attempt that is gone.
                let worker = worker
                    .with_attempt_timeout(Some(config.analysis_timeout))
                    .with_stale_after(Some(config.analysis_timeout + TIMEOUT_GRACE));
                let scheduler = BrokerScheduler::new(Arc::clone(&broker))
                    .register(QueueName::ImageAnalysis, Arc::new(AnalysisHandler::new(worker)))
                    .register(
                        QueueName::Cleanup,
                        Arc::new(CleanupHandler::new(Arc::clone(&store), config.retention)),
                    )
                    .with_timeout(QueueName::ImageAnalysis, config.analysis_timeout)
                    .with_attempts(QueueName::ImageAnalysis, config.max_retries.max(1) as u32);
                let admin = BrokerAdmin::new(broker).with_store(Arc::clone(&store));
                (Arc::new(scheduler), Arc::new(admin))
            }
        };

        Ok(Self {
            config,
            store,
            scheduler,
            admin,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn admin(&self) -> &Arc<dyn QueueAdmin> {
        &self.admin
    }

    /// Cleanup loop for the polling deployment. The broker runs cleanup as a
    /// delayed task instead, so this is `None` there.
    pub fn maintenance(&self) -> Option<MaintenanceLoop> {
        match self.config.mode {
            SchedulerMode::Polling => Some(MaintenanceLoop::new(Arc::clone(&self.store), self.config.retention)),
            SchedulerMode::Broker => None,
        }
    }

    /// Create a pending job and hand it to the scheduler.
    pub async fn submit(&self, new: NewAnalysisJob, tier: SubscriptionTier) -> Result<AnalysisJob, SchedulerError> {
        let job = self.store.create_job(self.with_expiry(new)).await?;
        self.scheduler.admit(&job, tier).await?;

        metrics::counter!("analysis_jobs_submitted_total").increment(1);
        tracing::info!(job_id = %job.id, user_id = %job.user_id, tier = %tier, "Analysis job submitted");
        Ok(job)
    }

    /// Create one pending job per image and admit them together.
    pub async fn submit_batch(
        &self,
        batch: Vec<NewAnalysisJob>,
        tier: SubscriptionTier,
    ) -> Result<Vec<AnalysisJob>, SchedulerError> {
        let mut jobs = Vec::with_capacity(batch.len());
        for new in batch {
            jobs.push(self.store.create_job(self.with_expiry(new)).await?);
        }
        self.scheduler.admit_batch(&jobs, tier).await?;

        metrics::counter!("analysis_jobs_submitted_total").increment(jobs.len() as u64);
        tracing::info!(count = jobs.len(), tier = %tier, "Analysis batch submitted");
        Ok(jobs)
    }

    /// Make sure a cleanup schedule exists and its next occurrence is planned.
    /// A stored schedule wins over the configured default.
    pub async fn ensure_cleanup_schedule(&self) -> Result<DateTime<Utc>, AdminError> {
        let at = self.admin.cleanup_schedule().await?.unwrap_or(self.config.cleanup_at);
        self.admin.schedule_cleanup(at).await
    }

    fn with_expiry(&self, mut new: NewAnalysisJob) -> NewAnalysisJob {
        if new.expires_at.is_none() {
            new.expires_at = self
                .config
                .job_ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| Utc::now() + ttl);
        }
        new
    }
}
