use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use std::str::FromStr;

use crate::app_state::AppState;
use crate::auth::AdminUser;
use crate::models::api::{
    ClearQueueResponse, RetryFailedRequest, RetryFailedResponse, ScheduleCleanupRequest,
    ScheduleCleanupResponse,
};
use crate::models::queue::{DailyAt, QueueName, QueueStats};
use crate::pipeline::admin::AdminError;

const DEFAULT_RETRY_LIMIT: u64 = 100;

fn admin_status(e: AdminError) -> StatusCode {
    match e {
        AdminError::Unsupported { .. } => StatusCode::CONFLICT,
        e => {
            tracing::error!(error = %e, "Queue administration failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn queue_name(name: &str) -> Result<QueueName, StatusCode> {
    QueueName::from_str(name).map_err(|_| StatusCode::NOT_FOUND)
}

/// GET /api/v1/admin/queues
pub async fn queue_stats(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Vec<QueueStats>>, StatusCode> {
    let stats = state.pipeline.admin().queue_stats().await.map_err(admin_status)?;
    Ok(Json(stats))
}

/// POST /api/v1/admin/queues/{name}/pause
pub async fn pause_queue(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(name): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let queue = queue_name(&name)?;
    state.pipeline.admin().pause(queue).await.map_err(admin_status)?;
    tracing::info!(admin = %admin.user_id, queue = %queue, "Pause requested");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/admin/queues/{name}/resume
pub async fn resume_queue(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(name): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let queue = queue_name(&name)?;
    state.pipeline.admin().resume(queue).await.map_err(admin_status)?;
    tracing::info!(admin = %admin.user_id, queue = %queue, "Resume requested");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/admin/queues/{name}/retry: body `{"limit": N}` is optional.
pub async fn retry_failed(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(name): Path<String>,
    body: Option<Json<RetryFailedRequest>>,
) -> Result<Json<RetryFailedResponse>, StatusCode> {
    let queue = queue_name(&name)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    request.validate().map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;

    let limit = request.limit.unwrap_or(DEFAULT_RETRY_LIMIT);
    let outcome = state
        .pipeline
        .admin()
        .retry_failed(queue, limit)
        .await
        .map_err(admin_status)?;
    Ok(Json(RetryFailedResponse {
        retried: outcome.retried,
        runnable: outcome.runnable,
    }))
}

/// POST /api/v1/admin/queues/{name}/clear
pub async fn clear_queue(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(name): Path<String>,
) -> Result<Json<ClearQueueResponse>, StatusCode> {
    let queue = queue_name(&name)?;
    let removed = state.pipeline.admin().clear(queue).await.map_err(admin_status)?;
    Ok(Json(ClearQueueResponse { removed }))
}

/// POST /api/v1/admin/cleanup: set the daily UTC cleanup time.
pub async fn schedule_cleanup(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(request): Json<ScheduleCleanupRequest>,
) -> Result<Json<ScheduleCleanupResponse>, StatusCode> {
    request.validate().map_err(|_| StatusCode::UNPROCESSABLE_ENTITY)?;
    let at = DailyAt::new(request.hour, request.minute).ok_or(StatusCode::UNPROCESSABLE_ENTITY)?;

    let next_run_at = state
        .pipeline
        .admin()
        .schedule_cleanup(at)
        .await
        .map_err(admin_status)?;
    Ok(Json(ScheduleCleanupResponse { next_run_at }))
}
