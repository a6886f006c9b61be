use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{instrument, Span};
use uuid::Uuid;

use super::classifier::{classify, classify_persistence, Classification, ErrorCategory};
use super::retry::{RetryDecision, RetryPolicy};
use super::store::{JobStore, StoreError};
use crate::models::analysis::FoodAnalysis;
use crate::models::job::{AnalysisJob, JobStatus};
use crate::services::meals::{MealError, MealRecorder};
use crate::services::vision::{AnalysisError, VisionAnalyzer};

/// Percentage reported once the image is handed to the vision model.
pub const ANALYZING_PROGRESS: u8 = 50;

/// Receives coarse progress updates while a job runs.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, percent: u8);
}

/// Progress sink for paths that have nowhere to report to.
pub struct NoProgress;

#[async_trait]
impl ProgressReporter for NoProgress {
    async fn report(&self, _percent: u8) {}
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed {
        meal_id: Uuid,
        result: serde_json::Value,
    },
    /// Back to `pending`; a scheduler may admit it again.
    Retrying {
        retry_count: i32,
        category: ErrorCategory,
        error: String,
    },
    Failed {
        retry_count: i32,
        category: ErrorCategory,
        error: String,
    },
}

/// Per-image entry of a batch run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchItem {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meal_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub retry_count: i32,
}

/// Partial-success tally of a batch run.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BatchReport {
    pub results: Vec<BatchItem>,
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Persistence(#[from] MealError),
}

impl StepError {
    fn classification(&self) -> Classification {
        match self {
            StepError::Analysis(e) => classify(e),
            StepError::Persistence(e) => classify_persistence(e),
        }
    }
}

/// Drives one job attempt end to end: analysis, meal persistence, and the
/// resulting state transition. Shared by both schedulers.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn JobStore>,
    analyzer: Arc<dyn VisionAnalyzer>,
    meals: Arc<dyn MealRecorder>,
    retry: RetryPolicy,
    attempt_timeout: Option<Duration>,
    stale_after: Option<Duration>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        analyzer: Arc<dyn VisionAnalyzer>,
        meals: Arc<dyn MealRecorder>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            analyzer,
            meals,
            retry,
            attempt_timeout: None,
            stale_after: None,
        }
    }

    /// Deadline for one attempt, covering image load, analysis and meal
    /// persistence. Running out counts as a retryable network failure.
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// A `processing` row untouched for longer than this belongs to an attempt
    /// that died; `claim_and_process` settles it as failed and runs it again.
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Claim a specific pending job and run it. `None` if the job is not pending
    /// (unknown, expired, running elsewhere, or finished). A job left in
    /// `processing` by a dead attempt is recovered first when `stale_after` is set.
    pub async fn claim_and_process(
        &self,
        job_id: Uuid,
        progress: &dyn ProgressReporter,
    ) -> Result<Option<AttemptOutcome>, WorkerError> {
        if let Some(job) = self.store.mark_processing(job_id).await? {
            return Ok(Some(self.process(job, progress).await?));
        }

        if let Some(outcome) = self.recover_abandoned(job_id).await? {
            if !matches!(outcome, AttemptOutcome::Retrying { .. }) {
                return Ok(Some(outcome));
            }
            if let Some(job) = self.store.mark_processing(job_id).await? {
                return Ok(Some(self.process(job, progress).await?));
            }
        }

        tracing::info!(job_id = %job_id, "Job is not pending, skipping");
        Ok(None)
    }

    /// Count the dead attempt against the job like any other timeout.
    async fn recover_abandoned(&self, job_id: Uuid) -> Result<Option<AttemptOutcome>, WorkerError> {
        let Some(stale_after) = self.stale_after else {
            return Ok(None);
        };
        let Some(job) = self.store.reclaim_abandoned(job_id, stale_after).await? else {
            return Ok(None);
        };

        tracing::warn!(
            job_id = %job.id,
            retry_count = job.retry_count,
            stale_secs = stale_after.as_secs(),
            "Recovering job abandoned in processing"
        );
        let outcome = self
            .settle_failure(&job, AnalysisError::Timeout(stale_after).into(), &Span::none())
            .await?;
        Ok(Some(outcome))
    }

    /// Run one attempt of a job that is already `processing`.
    #[instrument(
        name = "worker.process",
        skip_all,
        fields(
            job_id = %job.id,
            attempt = job.retry_count + 1,
            conclusion = tracing::field::Empty,
            category = tracing::field::Empty
        ),
        err
    )]
    pub async fn process(
        &self,
        job: AnalysisJob,
        progress: &dyn ProgressReporter,
    ) -> Result<AttemptOutcome, WorkerError> {
        let span = Span::current();
        let start = Instant::now();

        let steps = self.run_steps(&job, progress);
        let outcome = match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, steps)
                .await
                .unwrap_or_else(|_| Err(AnalysisError::Timeout(limit).into())),
            None => steps.await,
        };

        match outcome {
            Ok((analysis, meal_id)) => {
                let result = serde_json::to_value(&analysis)?;
                self.store.complete_job(job.id, &result, meal_id).await?;

                span.record("conclusion", "completed");
                metrics::counter!("analysis_jobs_completed_total").increment(1);
                metrics::histogram!("analysis_processing_seconds").record(start.elapsed().as_secs_f64());
                tracing::info!(
                    job_id = %job.id,
                    meal_id = %meal_id,
                    dish = %analysis.dish_name,
                    calories = analysis.nutrition.calories,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );

                Ok(AttemptOutcome::Completed { meal_id, result })
            }
            Err(err) => self.settle_failure(&job, err, &span).await,
        }
    }

    /// Classify a failed attempt, bump `retry_count` and write the row back to
    /// `pending` or `failed`.
    async fn settle_failure(
        &self,
        job: &AnalysisJob,
        err: StepError,
        span: &Span,
    ) -> Result<AttemptOutcome, WorkerError> {
        let verdict = err.classification();
        let retry_count = job.retry_count + 1;
        let error = err.to_string();
        span.record("category", tracing::field::display(verdict.category));

        match self.retry.decide(retry_count, verdict) {
            RetryDecision::Retry => {
                self.store
                    .record_failure(job.id, &error, retry_count, JobStatus::Pending)
                    .await?;
                span.record("conclusion", "retrying");
                metrics::counter!("analysis_jobs_retried_total", "category" => verdict.category.to_string())
                    .increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    retry_count,
                    category = %verdict.category,
                    error = %error,
                    "Job attempt failed, returned to pending"
                );
                Ok(AttemptOutcome::Retrying {
                    retry_count,
                    category: verdict.category,
                    error,
                })
            }
            RetryDecision::Fail => {
                self.store
                    .record_failure(job.id, &error, retry_count, JobStatus::Failed)
                    .await?;
                span.record("conclusion", "failed");
                metrics::counter!("analysis_jobs_failed_total", "category" => verdict.category.to_string())
                    .increment(1);
                tracing::error!(
                    job_id = %job.id,
                    retry_count,
                    category = %verdict.category,
                    retryable = verdict.retryable,
                    error = %error,
                    "Job failed"
                );
                Ok(AttemptOutcome::Failed {
                    retry_count,
                    category: verdict.category,
                    error,
                })
            }
        }
    }

    async fn run_steps(
        &self,
        job: &AnalysisJob,
        progress: &dyn ProgressReporter,
    ) -> Result<(FoodAnalysis, Uuid), StepError> {
        let image = match self.store.load_image(job.id).await {
            Ok(Some(bytes)) if !bytes.is_empty() => bytes,
            Ok(_) => return Err(AnalysisError::InvalidImage("image payload missing".to_string()).into()),
            Err(e) => return Err(AnalysisError::Other(format!("could not load image: {e}")).into()),
        };

        progress.report(ANALYZING_PROGRESS).await;
        tracing::debug!(job_id = %job.id, bytes = image.len(), "Calling vision model");

        let analysis = self.analyzer.analyze(&image, job.meal_type).await?;

        let meal_id = self.meals.record_meal(job, &analysis).await?;
        Ok((analysis, meal_id))
    }

    /// Run several jobs one after another, reporting proportional progress.
    /// A failing image does not stop the batch.
    pub async fn process_batch(
        &self,
        job_ids: &[Uuid],
        progress: &dyn ProgressReporter,
    ) -> Result<BatchReport, WorkerError> {
        let mut report = BatchReport::default();
        let total = job_ids.len().max(1);

        for (index, job_id) in job_ids.iter().enumerate() {
            let item = match self.claim_and_process(*job_id, &NoProgress).await {
                Ok(Some(outcome)) => batch_item(*job_id, outcome),
                Ok(None) => {
                    let current = self.store.find_job(*job_id).await?;
                    BatchItem {
                        job_id: *job_id,
                        status: current.as_ref().map(|j| j.status).unwrap_or(JobStatus::Failed),
                        meal_id: current.as_ref().and_then(|j| j.produced_meal_id),
                        error: current.and_then(|j| j.error).or_else(|| Some("job not pending".to_string())),
                        retry_count: 0,
                    }
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Batch item could not be recorded");
                    BatchItem {
                        job_id: *job_id,
                        status: JobStatus::Failed,
                        meal_id: None,
                        error: Some(e.to_string()),
                        retry_count: 0,
                    }
                }
            };

            if item.status == JobStatus::Completed {
                report.success += 1;
            } else {
                report.failed += 1;
            }
            report.results.push(item);

            let percent = ((index + 1) * 100 / total) as u8;
            progress.report(percent).await;
        }

        Ok(report)
    }
}

fn batch_item(job_id: Uuid, outcome: AttemptOutcome) -> BatchItem {
    match outcome {
        AttemptOutcome::Completed { meal_id, .. } => BatchItem {
            job_id,
            status: JobStatus::Completed,
            meal_id: Some(meal_id),
            error: None,
            retry_count: 0,
        },
        AttemptOutcome::Retrying { retry_count, error, .. } => BatchItem {
            job_id,
            status: JobStatus::Pending,
            meal_id: None,
            error: Some(error),
            retry_count,
        },
        AttemptOutcome::Failed { retry_count, error, .. } => BatchItem {
            job_id,
            status: JobStatus::Failed,
            meal_id: None,
            error: Some(error),
            retry_count,
        },
    }
}
