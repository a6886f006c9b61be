use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{AnalysisJob, JobStatus, MealType, NewAnalysisJob, StatusCounts};

const JOB_COLUMNS: &str = "id, user_id, image_ref, image_content_type, meal_type, status, result, \
     produced_meal_id, error, retry_count, created_at, updated_at, started_at, completed_at, expires_at";

fn decode_err(e: strum::ParseError) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

fn job_from_row(row: &PgRow) -> Result<AnalysisJob, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let meal_type: String = row.try_get("meal_type")?;

    Ok(AnalysisJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        image_ref: row.try_get("image_ref")?,
        image_content_type: row.try_get("image_content_type")?,
        meal_type: MealType::from_str(&meal_type).map_err(decode_err)?,
        status: JobStatus::from_str(&status).map_err(decode_err)?,
        result: row.try_get("result")?,
        produced_meal_id: row.try_get("produced_meal_id")?,
        error: row.try_get("error")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

/// Insert a new analysis job in `pending`.
pub async fn create_job(pool: &PgPool, new: &NewAnalysisJob) -> Result<AnalysisJob, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO analysis_jobs (user_id, image_ref, image_content_type, image_data, meal_type, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(new.user_id)
    .bind(&new.image_ref)
    .bind(&new.image_content_type)
    .bind(&new.image_data)
    .bind(new.meal_type.to_string())
    .bind(new.expires_at)
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by ID, regardless of owner.
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<AnalysisJob>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Get a job by ID only if it belongs to `user_id`.
pub async fn get_owned_job(
    pool: &PgPool,
    job_id: Uuid,
    user_id: Uuid,
) -> Result<Option<AnalysisJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1 AND user_id = $2"
    ))
    .bind(job_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// List a user's jobs, newest first.
pub async fn list_jobs(pool: &PgPool, user_id: Uuid, limit: i64) -> Result<Vec<AnalysisJob>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM analysis_jobs
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#
    ))
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Load the uploaded image bytes for a job.
pub async fn load_image(pool: &PgPool, job_id: Uuid) -> Result<Option<Vec<u8>>, sqlx::Error> {
    let row = sqlx::query("SELECT image_data FROM analysis_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| r.try_get("image_data")).transpose()
}

/// Claim up to `limit` eligible pending jobs, oldest first, moving them to
/// `processing` in the same statement.
///
/// `FOR UPDATE SKIP LOCKED` keeps concurrent pollers (in this or any other
/// process) from selecting the same row. With `retry_backoff` set, a row that
/// has already failed waits `backoff * 2^retry_count` after its last update.
pub async fn claim_pending_jobs(
    pool: &PgPool,
    limit: i64,
    retry_backoff: Option<Duration>,
) -> Result<Vec<AnalysisJob>, sqlx::Error> {
    let backoff_secs = retry_backoff.map(|d| d.as_secs_f64());

    let rows = sqlx::query(&format!(
        r#"
        WITH eligible AS (
            SELECT id
            FROM analysis_jobs
            WHERE status = 'pending'
              AND (expires_at IS NULL OR expires_at > NOW())
              AND ($2::float8 IS NULL
                   OR retry_count = 0
                   OR updated_at + make_interval(secs => $2::float8 * power(2, retry_count)) <= NOW())
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE analysis_jobs AS j
        SET status = 'processing',
            started_at = COALESCE(j.started_at, NOW()),
            updated_at = NOW()
        FROM eligible
        WHERE j.id = eligible.id
        RETURNING {}
        "#,
        prefixed_columns("j")
    ))
    .bind(limit)
    .bind(backoff_secs)
    .fetch_all(pool)
    .await?;

    let mut jobs: Vec<AnalysisJob> = rows.iter().map(job_from_row).collect::<Result<_, _>>()?;
    jobs.sort_by_key(|j| j.created_at);
    Ok(jobs)
}

fn prefixed_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Move one specific job from `pending` to `processing`. Returns `None` if the
/// job is missing, expired, or not pending (already claimed or terminal).
pub async fn mark_processing(pool: &PgPool, job_id: Uuid) -> Result<Option<AnalysisJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE analysis_jobs
        SET status = 'processing',
            started_at = COALESCE(started_at, NOW()),
            updated_at = NOW()
        WHERE id = $1
          AND status = 'pending'
          AND (expires_at IS NULL OR expires_at > NOW())
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Take over a `processing` row last touched before `updated_before`. The
/// refreshed `updated_at` makes a second caller's predicate fail.
pub async fn reclaim_abandoned(
    pool: &PgPool,
    job_id: Uuid,
    updated_before: DateTime<Utc>,
) -> Result<Option<AnalysisJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE analysis_jobs
        SET updated_at = NOW()
        WHERE id = $1
          AND status = 'processing'
          AND updated_at < $2
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(updated_before)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Put a claimed job back to `pending`, leaving `retry_count` alone.
pub async fn release_claim(pool: &PgPool, job_id: Uuid) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = 'pending',
            updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(done.rows_affected())
}

/// Persist a successful attempt. Returns the number of rows updated (0 if the
/// job was not `processing`).
pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    result: &serde_json::Value,
    meal_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = 'completed',
            result = $2,
            produced_meal_id = $3,
            error = NULL,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(job_id)
    .bind(result)
    .bind(meal_id)
    .execute(pool)
    .await?;

    Ok(done.rows_affected())
}

/// Persist a failed attempt: either back to `pending` or terminal `failed`.
pub async fn record_failure(
    pool: &PgPool,
    job_id: Uuid,
    error: &str,
    retry_count: i32,
    status: JobStatus,
) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = $2,
            error = $3,
            retry_count = GREATEST(retry_count, $4),
            completed_at = CASE WHEN $2 = 'failed' THEN NOW() ELSE completed_at END,
            updated_at = NOW()
        WHERE id = $1 AND status = 'processing'
        "#,
    )
    .bind(job_id)
    .bind(status.to_string())
    .bind(error)
    .bind(retry_count)
    .execute(pool)
    .await?;

    Ok(done.rows_affected())
}

/// Delete completed jobs whose completion is older than `older_than`.
pub async fn delete_expired_jobs(pool: &PgPool, older_than: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let done = sqlx::query(
        r#"
        DELETE FROM analysis_jobs
        WHERE status = 'completed' AND completed_at < $1
        "#,
    )
    .bind(older_than)
    .execute(pool)
    .await?;

    Ok(done.rows_affected())
}

/// Count jobs per status. With `retry_backoff` set, pending rows whose
/// backoff has not elapsed are also counted as `backing_off`.
pub async fn count_by_status(pool: &PgPool, retry_backoff: Option<Duration>) -> Result<StatusCounts, sqlx::Error> {
    let backoff_secs = retry_backoff.map(|d| d.as_secs_f64());

    let rows = sqlx::query(
        r#"
        SELECT status,
               ($1::float8 IS NOT NULL
                AND retry_count > 0
                AND updated_at + make_interval(secs => $1::float8 * power(2, retry_count)) > NOW()) AS held,
               COUNT(*) AS n
        FROM analysis_jobs
        GROUP BY 1, 2
        "#,
    )
    .bind(backoff_secs)
    .fetch_all(pool)
    .await?;

    let mut counts = StatusCounts::default();
    for row in rows {
        let status: String = row.try_get("status")?;
        let held: bool = row.try_get("held")?;
        let n = row.try_get::<i64, _>("n")?.max(0) as u64;
        match JobStatus::from_str(&status).map_err(decode_err)? {
            JobStatus::Pending => {
                counts.pending += n;
                if held {
                    counts.backing_off += n;
                }
            }
            JobStatus::Processing => counts.processing += n,
            JobStatus::Completed => counts.completed += n,
            JobStatus::Failed => counts.failed += n,
        }
    }
    Ok(counts)
}
