use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a food-photo analysis job.
///
/// `Pending` is both the initial state and the state a job returns to after a
/// retryable failure. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Classification hint supplied by the client at submission time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MealType {
    Breakfast,
    Lunch,
    Dinner,
    #[default]
    Snack,
}

/// A persisted analysis job. The uploaded image bytes live in the same row but
/// are loaded separately (see `JobStore::load_image`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_ref: String,
    pub image_content_type: String,
    pub meal_type: MealType,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub produced_meal_id: Option<Uuid>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Input for the submission entry point.
#[derive(Debug, Clone)]
pub struct NewAnalysisJob {
    pub user_id: Uuid,
    pub image_ref: String,
    pub image_content_type: String,
    pub image_data: Vec<u8>,
    pub meal_type: MealType,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Row counts per status, used for queue statistics in the polling path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    /// Pending rows still waiting out their retry backoff.
    pub backing_off: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}
