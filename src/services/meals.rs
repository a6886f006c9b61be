use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::meals;
use crate::models::analysis::FoodAnalysis;
use crate::models::job::AnalysisJob;

/// The meal-persistence collaborator: turns one analysis result into exactly
/// one durable meal record and returns its id.
#[async_trait]
pub trait MealRecorder: Send + Sync {
    async fn record_meal(&self, job: &AnalysisJob, analysis: &FoodAnalysis) -> Result<Uuid, MealError>;
}

#[derive(Debug, thiserror::Error)]
pub enum MealError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Rejected(String),
}

/// Writes meals to the `meals` table, keyed by the producing job.
pub struct PgMealRecorder {
    pool: PgPool,
}

impl PgMealRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MealRecorder for PgMealRecorder {
    async fn record_meal(&self, job: &AnalysisJob, analysis: &FoodAnalysis) -> Result<Uuid, MealError> {
        let meal_id = meals::insert_meal_for_job(&self.pool, job, analysis).await?;
        tracing::debug!(job_id = %job.id, meal_id = %meal_id, "Meal recorded");
        Ok(meal_id)
    }
}
