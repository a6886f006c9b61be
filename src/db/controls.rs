use sqlx::{PgPool, Row};

use crate::models::queue::{DailyAt, QueueName};

const CLEANUP_SCHEDULE: &str = "cleanup";

/// Whether `queue` has been paused by an operator.
pub async fn is_paused(pool: &PgPool, queue: QueueName) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT paused FROM queue_controls WHERE queue_name = $1")
        .bind(queue.to_string())
        .fetch_optional(pool)
        .await?;

    Ok(match row {
        Some(r) => r.try_get("paused")?,
        None => false,
    })
}

pub async fn set_paused(pool: &PgPool, queue: QueueName, paused: bool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO queue_controls (queue_name, paused, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (queue_name) DO UPDATE SET paused = EXCLUDED.paused, updated_at = NOW()
        "#,
    )
    .bind(queue.to_string())
    .bind(paused)
    .execute(pool)
    .await?;

    Ok(())
}

/// The daily cleanup time set by an operator, if any.
pub async fn cleanup_schedule(pool: &PgPool) -> Result<Option<DailyAt>, sqlx::Error> {
    let row = sqlx::query("SELECT hour, minute FROM maintenance_schedule WHERE name = $1")
        .bind(CLEANUP_SCHEDULE)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(r) => {
            let hour: i16 = r.try_get("hour")?;
            let minute: i16 = r.try_get("minute")?;
            Ok(DailyAt::new(hour as u32, minute as u32))
        }
        None => Ok(None),
    }
}

pub async fn set_cleanup_schedule(pool: &PgPool, at: DailyAt) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO maintenance_schedule (name, hour, minute, updated_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (name) DO UPDATE SET hour = EXCLUDED.hour, minute = EXCLUDED.minute, updated_at = NOW()
        "#,
    )
    .bind(CLEANUP_SCHEDULE)
    .bind(at.hour as i16)
    .bind(at.minute as i16)
    .execute(pool)
    .await?;

    Ok(())
}
