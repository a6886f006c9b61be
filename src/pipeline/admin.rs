use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;

use super::broker::{Broker, BrokerError};
use super::handlers::AnalysisPayload;
use super::maintenance::enqueue_next_cleanup;
use super::store::{JobStore, StoreError};
use crate::models::queue::{DailyAt, QueueName, QueueStats, Task};

/// Operator controls over the named queues. Callers are expected to have
/// checked for the admin role already.
#[async_trait]
pub trait QueueAdmin: Send + Sync {
    async fn queue_stats(&self) -> Result<Vec<QueueStats>, AdminError>;

    /// Stop admitting new work. In-flight work is unaffected.
    async fn pause(&self, queue: QueueName) -> Result<(), AdminError>;

    async fn resume(&self, queue: QueueName) -> Result<(), AdminError>;

    /// Re-admit up to `limit` failed tasks.
    async fn retry_failed(&self, queue: QueueName, limit: u64) -> Result<RetryOutcome, AdminError>;

    /// Drop all waiting and active tasks. Returns how many were dropped.
    async fn clear(&self, queue: QueueName) -> Result<u64, AdminError>;

    /// Persist a daily UTC cleanup time and return the next run.
    async fn schedule_cleanup(&self, at: DailyAt) -> Result<DateTime<Utc>, AdminError>;

    async fn cleanup_schedule(&self) -> Result<Option<DailyAt>, AdminError>;
}

/// Result of a bulk retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    pub retried: u64,
    /// Re-admitted tasks with work left to do.
    pub runnable: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{operation} is not supported for queue {queue} in this deployment")]
    Unsupported { operation: &'static str, queue: QueueName },
}

/// Administration backed by the broker; covers every named queue.
pub struct BrokerAdmin {
    broker: Arc<dyn Broker>,
    store: Option<Arc<dyn JobStore>>,
}

impl BrokerAdmin {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker, store: None }
    }

    /// Job rows to check analysis tasks against on bulk retry.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// How many of `tasks` still point at a job that is not terminal. A batch
    /// counts when any of its jobs does.
    async fn count_runnable(store: &dyn JobStore, tasks: &[Task]) -> Result<u64, AdminError> {
        let mut runnable = 0;
        for task in tasks {
            let job_ids = match serde_json::from_value::<AnalysisPayload>(task.payload.clone()) {
                Ok(AnalysisPayload::Single { job_id }) => vec![job_id],
                Ok(AnalysisPayload::Batch { job_ids }) => job_ids,
                Err(_) => continue,
            };
            for job_id in job_ids {
                if store.find_job(job_id).await?.is_some_and(|j| !j.status.is_terminal()) {
                    runnable += 1;
                    break;
                }
            }
        }
        Ok(runnable)
    }
}

#[async_trait]
impl QueueAdmin for BrokerAdmin {
    async fn queue_stats(&self) -> Result<Vec<QueueStats>, AdminError> {
        let mut stats = Vec::new();
        for queue in QueueName::iter() {
            stats.push(self.broker.stats(queue).await?);
        }
        Ok(stats)
    }

    async fn pause(&self, queue: QueueName) -> Result<(), AdminError> {
        self.broker.pause(queue).await?;
        tracing::info!(queue = %queue, "Queue paused");
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<(), AdminError> {
        self.broker.resume(queue).await?;
        tracing::info!(queue = %queue, "Queue resumed");
        Ok(())
    }

    async fn retry_failed(&self, queue: QueueName, limit: u64) -> Result<RetryOutcome, AdminError> {
        let runnable = match (queue, &self.store) {
            (QueueName::ImageAnalysis, Some(store)) => {
                let tasks = self.broker.failed_tasks(queue, limit).await?;
                Some(Self::count_runnable(store.as_ref(), &tasks).await?)
            }
            _ => None,
        };

        let retried = self.broker.retry_failed(queue, limit).await?;
        let runnable = runnable.map_or(retried, |n| n.min(retried));
        if runnable < retried {
            tracing::warn!(
                queue = %queue,
                retried,
                runnable,
                "Some re-admitted tasks belong to finished jobs and will be skipped"
            );
        } else {
            tracing::info!(queue = %queue, retried, limit, "Failed tasks re-admitted");
        }
        Ok(RetryOutcome { retried, runnable })
    }

    async fn clear(&self, queue: QueueName) -> Result<u64, AdminError> {
        let removed = self.broker.clear(queue).await?;
        tracing::warn!(queue = %queue, removed, "Queue cleared");
        Ok(removed)
    }

    async fn schedule_cleanup(&self, at: DailyAt) -> Result<DateTime<Utc>, AdminError> {
        self.broker.set_schedule(QueueName::Cleanup, at).await?;
        Ok(enqueue_next_cleanup(self.broker.as_ref(), at, Utc::now()).await?)
    }

    async fn cleanup_schedule(&self) -> Result<Option<DailyAt>, AdminError> {
        Ok(self.broker.schedule(QueueName::Cleanup).await?)
    }
}

/// Administration for the polling deployment, where the job table is the only
/// queue. Only `image-analysis` exists; failed rows are terminal and are never
/// re-admitted or dropped from here.
pub struct StoreAdmin {
    store: Arc<dyn JobStore>,
    retry_backoff: Option<Duration>,
}

impl StoreAdmin {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            retry_backoff: None,
        }
    }

    /// The polling scheduler's retry backoff; rows it holds back show as `delayed`.
    pub fn with_retry_backoff(mut self, backoff: Option<Duration>) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn only_analysis(queue: QueueName, operation: &'static str) -> Result<(), AdminError> {
        match queue {
            QueueName::ImageAnalysis => Ok(()),
            _ => Err(AdminError::Unsupported { operation, queue }),
        }
    }
}

#[async_trait]
impl QueueAdmin for StoreAdmin {
    async fn queue_stats(&self) -> Result<Vec<QueueStats>, AdminError> {
        let counts = self.store.count_by_status(self.retry_backoff).await?;
        let is_paused = self.store.queue_paused(QueueName::ImageAnalysis).await?;
        let waiting = counts.pending.saturating_sub(counts.backing_off);

        Ok(vec![QueueStats {
            queue_name: QueueName::ImageAnalysis,
            waiting: if is_paused { 0 } else { waiting },
            active: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            delayed: counts.backing_off,
            paused: if is_paused { waiting } else { 0 },
            is_paused,
        }])
    }

    async fn pause(&self, queue: QueueName) -> Result<(), AdminError> {
        Self::only_analysis(queue, "pause")?;
        self.store.set_queue_paused(queue, true).await?;
        tracing::info!(queue = %queue, "Queue paused");
        Ok(())
    }

    async fn resume(&self, queue: QueueName) -> Result<(), AdminError> {
        Self::only_analysis(queue, "resume")?;
        self.store.set_queue_paused(queue, false).await?;
        tracing::info!(queue = %queue, "Queue resumed");
        Ok(())
    }

    async fn retry_failed(&self, queue: QueueName, _limit: u64) -> Result<RetryOutcome, AdminError> {
        Err(AdminError::Unsupported { operation: "retry", queue })
    }

    async fn clear(&self, queue: QueueName) -> Result<u64, AdminError> {
        Err(AdminError::Unsupported { operation: "clear", queue })
    }

    async fn schedule_cleanup(&self, at: DailyAt) -> Result<DateTime<Utc>, AdminError> {
        self.store.set_cleanup_schedule(at).await?;
        let next = at.next_after(Utc::now());
        tracing::info!(next_run_at = %next, "Cleanup schedule stored");
        Ok(next)
    }

    async fn cleanup_schedule(&self) -> Result<Option<DailyAt>, AdminError> {
        Ok(self.store.cleanup_schedule().await?)
    }
}
