use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::analysis::FoodAnalysis;
use crate::models::job::AnalysisJob;

/// Insert the meal produced by `job`, or return the id of the meal already
/// produced by it. `source_job_id` is unique, so a repeated call after a crash
/// between meal creation and job completion does not create a duplicate.
pub async fn insert_meal_for_job(
    pool: &PgPool,
    job: &AnalysisJob,
    analysis: &FoodAnalysis,
) -> Result<Uuid, sqlx::Error> {
    let analysis_json = serde_json::to_value(analysis).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    let row = sqlx::query(
        r#"
        INSERT INTO meals (user_id, source_job_id, meal_type, dish_name,
                           calories, protein_g, carbs_g, fat_g, fiber_g, analysis)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (source_job_id) DO UPDATE SET source_job_id = EXCLUDED.source_job_id
        RETURNING id
        "#,
    )
    .bind(job.user_id)
    .bind(job.id)
    .bind(job.meal_type.to_string())
    .bind(&analysis.dish_name)
    .bind(analysis.nutrition.calories)
    .bind(analysis.nutrition.protein_g)
    .bind(analysis.nutrition.carbs_g)
    .bind(analysis.nutrition.fat_g)
    .bind(analysis.nutrition.fiber_g)
    .bind(analysis_json)
    .fetch_one(pool)
    .await?;

    row.try_get("id")
}
