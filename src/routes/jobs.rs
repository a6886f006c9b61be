use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use std::str::FromStr;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::models::api::{JobResponse, ListJobsQuery, SubmitBatchResponse, SubmitJobResponse};
use crate::models::job::{JobStatus, MealType, NewAnalysisJob};

const MAX_BATCH_IMAGES: usize = 10;

struct Upload {
    file_name: String,
    content_type: String,
    data: Vec<u8>,
}

/// Read every `image` field and the `meal_type` field of a submission.
async fn read_uploads(multipart: &mut Multipart) -> Result<(Vec<Upload>, MealType), StatusCode> {
    let mut uploads = Vec::new();
    let mut meal_type = MealType::default();

    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        match field.name() {
            Some("image") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;

                let format = image::guess_format(&data).map_err(|_| StatusCode::UNSUPPORTED_MEDIA_TYPE)?;

                uploads.push(Upload {
                    file_name,
                    content_type: format.to_mime_type().to_string(),
                    data: data.to_vec(),
                });
            }
            Some("meal_type") => {
                let text = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                meal_type = MealType::from_str(text.trim()).map_err(|_| StatusCode::BAD_REQUEST)?;
            }
            _ => {}
        }
    }

    Ok((uploads, meal_type))
}

fn new_job(user: &AuthUser, upload: Upload, meal_type: MealType) -> NewAnalysisJob {
    NewAnalysisJob {
        user_id: user.user_id,
        image_ref: upload.file_name,
        image_content_type: upload.content_type,
        image_data: upload.data,
        meal_type,
        expires_at: None,
    }
}

/// POST /api/v1/jobs: Upload a meal photo for analysis.
pub async fn submit_job(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitJobResponse>), StatusCode> {
    let (mut uploads, meal_type) = read_uploads(&mut multipart).await?;
    if uploads.len() != 1 {
        return Err(StatusCode::BAD_REQUEST);
    }
    let upload = uploads.remove(0);

    let job = state
        .pipeline
        .submit(new_job(&user, upload, meal_type), user.tier)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %user.user_id, error = %e, "Failed to submit analysis job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// POST /api/v1/jobs/batch: Upload several meal photos sharing one meal type.
pub async fn submit_batch(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitBatchResponse>), StatusCode> {
    let (uploads, meal_type) = read_uploads(&mut multipart).await?;
    if uploads.is_empty() || uploads.len() > MAX_BATCH_IMAGES {
        return Err(StatusCode::BAD_REQUEST);
    }

    let batch = uploads
        .into_iter()
        .map(|upload| new_job(&user, upload, meal_type))
        .collect();
    let jobs = state.pipeline.submit_batch(batch, user.tier).await.map_err(|e| {
        tracing::error!(user_id = %user.user_id, error = %e, "Failed to submit analysis batch");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitBatchResponse {
            job_ids: jobs.iter().map(|j| j.id).collect(),
            status: JobStatus::Pending,
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: Status of one of the caller's jobs.
pub async fn get_job(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, StatusCode> {
    let job = state
        .pipeline
        .store()
        .get_job(job_id, user.user_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(job.into()))
}

/// GET /api/v1/jobs: The caller's jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobResponse>>, StatusCode> {
    let jobs = state
        .pipeline
        .store()
        .list_jobs(user.user_id, query.limit())
        .await
        .map_err(|e| {
            tracing::error!(user_id = %user.user_id, error = %e, "Failed to list jobs");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}
