use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::db::{controls, queries};
use crate::models::job::{AnalysisJob, JobStatus, NewAnalysisJob, StatusCounts};
use crate::models::queue::{DailyAt, QueueName};

/// Durable storage for job rows and for the queue controls of the polling path.
///
/// Writers after creation are limited to the worker (`mark_processing`,
/// `complete_job`, `record_failure`, and `claim_pending` on its behalf) and the
/// cleanup routine (`delete_expired`). Transition methods only touch rows in the
/// expected source state, so a terminal row is never written again.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, new: NewAnalysisJob) -> Result<AnalysisJob, StoreError>;

    /// `None` both when the job does not exist and when it belongs to someone else.
    async fn get_job(&self, job_id: Uuid, owner: Uuid) -> Result<Option<AnalysisJob>, StoreError>;

    async fn find_job(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError>;

    /// Newest first.
    async fn list_jobs(&self, owner: Uuid, limit: i64) -> Result<Vec<AnalysisJob>, StoreError>;

    async fn load_image(&self, job_id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically select up to `limit` eligible pending jobs (oldest first) and
    /// move them to `processing`. Concurrent callers never receive the same job.
    async fn claim_pending(
        &self,
        limit: usize,
        retry_backoff: Option<Duration>,
    ) -> Result<Vec<AnalysisJob>, StoreError>;

    /// Move one pending job to `processing`; `None` if it is not pending.
    async fn mark_processing(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError>;

    /// Take over a `processing` job whose last update is older than
    /// `stale_after`, refreshing `updated_at` so concurrent callers cannot
    /// both take it. `None` if the job is not processing or not yet stale.
    async fn reclaim_abandoned(&self, job_id: Uuid, stale_after: Duration) -> Result<Option<AnalysisJob>, StoreError>;

    /// Hand a claimed job back to `pending` without counting an attempt.
    /// Returns `false` if the job was no longer `processing`.
    async fn release_claim(&self, job_id: Uuid) -> Result<bool, StoreError>;

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: &serde_json::Value,
        meal_id: Uuid,
    ) -> Result<(), StoreError>;

    /// `status` is `Pending` for a retry or `Failed` for a terminal failure.
    async fn record_failure(
        &self,
        job_id: Uuid,
        error: &str,
        retry_count: i32,
        status: JobStatus,
    ) -> Result<(), StoreError>;

    /// Delete completed jobs whose `completed_at` is older than `retention`.
    async fn delete_expired(&self, retention: Duration) -> Result<u64, StoreError>;

    /// `retry_backoff` is the polling path's backoff base; pending rows it is
    /// still holding back are counted as `backing_off`.
    async fn count_by_status(&self, retry_backoff: Option<Duration>) -> Result<StatusCounts, StoreError>;

    async fn queue_paused(&self, queue: QueueName) -> Result<bool, StoreError>;

    async fn set_queue_paused(&self, queue: QueueName, paused: bool) -> Result<(), StoreError>;

    async fn cleanup_schedule(&self) -> Result<Option<DailyAt>, StoreError>;

    async fn set_cleanup_schedule(&self, at: DailyAt) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {job_id} is not {expected}")]
    StaleTransition { job_id: Uuid, expected: JobStatus },

    #[error("invalid retention period: {0:?}")]
    InvalidRetention(Duration),

    #[error("invalid staleness period: {0:?}")]
    InvalidStaleAfter(Duration),
}

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, new: NewAnalysisJob) -> Result<AnalysisJob, StoreError> {
        Ok(queries::create_job(&self.pool, &new).await?)
    }

    async fn get_job(&self, job_id: Uuid, owner: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
        Ok(queries::get_owned_job(&self.pool, job_id, owner).await?)
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn list_jobs(&self, owner: Uuid, limit: i64) -> Result<Vec<AnalysisJob>, StoreError> {
        Ok(queries::list_jobs(&self.pool, owner, limit).await?)
    }

    async fn load_image(&self, job_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(queries::load_image(&self.pool, job_id).await?)
    }

    async fn claim_pending(
        &self,
        limit: usize,
        retry_backoff: Option<Duration>,
    ) -> Result<Vec<AnalysisJob>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(queries::claim_pending_jobs(&self.pool, limit as i64, retry_backoff).await?)
    }

    async fn mark_processing(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
        Ok(queries::mark_processing(&self.pool, job_id).await?)
    }

    async fn reclaim_abandoned(&self, job_id: Uuid, stale_after: Duration) -> Result<Option<AnalysisJob>, StoreError> {
        let stale_after =
            chrono::Duration::from_std(stale_after).map_err(|_| StoreError::InvalidStaleAfter(stale_after))?;
        Ok(queries::reclaim_abandoned(&self.pool, job_id, Utc::now() - stale_after).await?)
    }

    async fn release_claim(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(queries::release_claim(&self.pool, job_id).await? > 0)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: &serde_json::Value,
        meal_id: Uuid,
    ) -> Result<(), StoreError> {
        match queries::complete_job(&self.pool, job_id, result, meal_id).await? {
            0 => Err(StoreError::StaleTransition {
                job_id,
                expected: JobStatus::Processing,
            }),
            _ => Ok(()),
        }
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        error: &str,
        retry_count: i32,
        status: JobStatus,
    ) -> Result<(), StoreError> {
        match queries::record_failure(&self.pool, job_id, error, retry_count, status).await? {
            0 => Err(StoreError::StaleTransition {
                job_id,
                expected: JobStatus::Processing,
            }),
            _ => Ok(()),
        }
    }

    async fn delete_expired(&self, retention: Duration) -> Result<u64, StoreError> {
        let retention =
            chrono::Duration::from_std(retention).map_err(|_| StoreError::InvalidRetention(retention))?;
        Ok(queries::delete_expired_jobs(&self.pool, Utc::now() - retention).await?)
    }

    async fn count_by_status(&self, retry_backoff: Option<Duration>) -> Result<StatusCounts, StoreError> {
        Ok(queries::count_by_status(&self.pool, retry_backoff).await?)
    }

    async fn queue_paused(&self, queue: QueueName) -> Result<bool, StoreError> {
        Ok(controls::is_paused(&self.pool, queue).await?)
    }

    async fn set_queue_paused(&self, queue: QueueName, paused: bool) -> Result<(), StoreError> {
        Ok(controls::set_paused(&self.pool, queue, paused).await?)
    }

    async fn cleanup_schedule(&self) -> Result<Option<DailyAt>, StoreError> {
        Ok(controls::cleanup_schedule(&self.pool).await?)
    }

    async fn set_cleanup_schedule(&self, at: DailyAt) -> Result<(), StoreError> {
        Ok(controls::set_cleanup_schedule(&self.pool, at).await?)
    }
}
