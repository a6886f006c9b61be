use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{AnalysisJob, JobStatus, MealType};

/// Response after submitting a food photo for analysis.
#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Response after submitting several photos at once.
#[derive(Debug, Serialize)]
pub struct SubmitBatchResponse {
    pub job_ids: Vec<Uuid>,
    pub status: JobStatus,
}

/// Job record as exposed to its owner.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub meal_type: MealType,
    pub image_ref: String,
    pub result: Option<serde_json::Value>,
    pub produced_meal_id: Option<Uuid>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<AnalysisJob> for JobResponse {
    fn from(job: AnalysisJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            meal_type: job.meal_type,
            image_ref: job.image_ref,
            result: job.result,
            produced_meal_id: job.produced_meal_id,
            error: job.error,
            retry_count: job.retry_count,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            expires_at: job.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<i64>,
}

impl ListJobsQuery {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

/// Body of `POST /api/v1/admin/queues/{name}/retry`.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct RetryFailedRequest {
    #[garde(range(min = 1, max = 10000))]
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RetryFailedResponse {
    pub retried: u64,
    /// Re-admitted tasks that will actually run. Analysis tasks whose job row
    /// is already terminal are skipped on delivery.
    pub runnable: u64,
}

#[derive(Debug, Serialize)]
pub struct ClearQueueResponse {
    pub removed: u64,
}

/// Body of `POST /api/v1/admin/cleanup`.
#[derive(Debug, Deserialize, Validate)]
pub struct ScheduleCleanupRequest {
    #[garde(range(min = 0, max = 23))]
    pub hour: u32,

    #[garde(range(min = 0, max = 59))]
    pub minute: u32,
}

#[derive(Debug, Serialize)]
pub struct ScheduleCleanupResponse {
    pub next_run_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_limit_is_clamped() {
        assert_eq!(ListJobsQuery { limit: None }.limit(), 20);
        assert_eq!(ListJobsQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(ListJobsQuery { limit: Some(5000) }.limit(), 100);
    }

    #[test]
    fn test_cleanup_request_validation() {
        assert!(ScheduleCleanupRequest { hour: 3, minute: 15 }.validate().is_ok());
        assert!(ScheduleCleanupRequest { hour: 24, minute: 0 }.validate().is_err());
        assert!(ScheduleCleanupRequest { hour: 0, minute: 60 }.validate().is_err());
    }
}
