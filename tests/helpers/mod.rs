//! Test helper utilities for E2E testing

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::multipart;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Response from POST /api/v1/jobs
#[derive(Debug, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// Response from GET /api/v1/jobs/{job_id}
#[derive(Debug, Deserialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub status: String,
    pub result: Option<serde_json::Value>,
    pub produced_meal_id: Option<Uuid>,
    pub error: Option<String>,
    pub retry_count: i32,
}

pub fn base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

/// Sign a caller token with the server's JWT_SECRET.
pub fn token_for(user_id: Uuid, role: &str) -> String {
    let secret = std::env::var("JWT_SECRET").expect("JWT_SECRET must be set");
    let claims = serde_json::json!({
        "sub": user_id,
        "role": role,
        "tier": "standard",
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .expect("Failed to sign token")
}

/// A small solid-colour PNG.
pub fn sample_png() -> Vec<u8> {
    let image = image::RgbImage::from_pixel(8, 8, image::Rgb([200, 60, 40]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("Failed to encode PNG");
    bytes
}

/// Upload one image to the submission endpoint.
pub async fn submit_image(
    client: &reqwest::Client,
    token: &str,
    bytes: Vec<u8>,
    meal_type: &str,
) -> Result<reqwest::Response, reqwest::Error> {
    let form = multipart::Form::new()
        .part("image", multipart::Part::bytes(bytes).file_name("meal.png"))
        .text("meal_type", meal_type.to_string());

    client
        .post(format!("{}/api/v1/jobs", base_url()))
        .bearer_auth(token)
        .multipart(form)
        .send()
        .await
}

pub async fn get_job(client: &reqwest::Client, token: &str, job_id: Uuid) -> Result<reqwest::Response, reqwest::Error> {
    client
        .get(format!("{}/api/v1/jobs/{}", base_url(), job_id))
        .bearer_auth(token)
        .send()
        .await
}

/// Poll a job until it reaches a terminal status or `max_wait` elapses.
pub async fn wait_for_terminal(
    client: &reqwest::Client,
    token: &str,
    job_id: Uuid,
    max_wait: Duration,
) -> Result<JobResponse, Box<dyn std::error::Error>> {
    let started = std::time::Instant::now();
    loop {
        let job: JobResponse = get_job(client, token, job_id).await?.error_for_status()?.json().await?;
        if job.status == "completed" || job.status == "failed" {
            return Ok(job);
        }
        if started.elapsed() > max_wait {
            return Err(format!("job {job_id} still {} after {max_wait:?}", job.status).into());
        }
        sleep(Duration::from_secs(2)).await;
    }
}
