use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::broker::{TaskContext, TaskError, TaskHandler};
use super::maintenance::{enqueue_next_cleanup, run_cleanup};
use super::store::JobStore;
use super::worker::{AttemptOutcome, Worker};
use crate::models::job::JobStatus;
use crate::models::queue::{DailyAt, QueueName, Task};

/// Body of a task on the `image-analysis` queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisPayload {
    Single { job_id: Uuid },
    Batch { job_ids: Vec<Uuid> },
}

impl AnalysisPayload {
    /// Task id for this payload. A single job's task is keyed by the job id so
    /// the same job is never queued twice.
    pub fn task_id(&self) -> String {
        match self {
            AnalysisPayload::Single { job_id } => job_id.to_string(),
            AnalysisPayload::Batch { .. } => format!("batch:{}", Uuid::new_v4()),
        }
    }
}

/// Runs analysis jobs delivered by the broker through the shared [`Worker`].
pub struct AnalysisHandler {
    worker: Worker,
}

impl AnalysisHandler {
    pub fn new(worker: Worker) -> Self {
        Self { worker }
    }

    async fn single(&self, job_id: Uuid, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
        let outcome = self
            .worker
            .claim_and_process(job_id, ctx)
            .await
            .map_err(|e| TaskError::Retry(e.to_string()))?;

        match outcome {
            None => match self.worker.store().find_job(job_id).await {
                // Still held by a live attempt elsewhere; try again once that
                // attempt has finished or gone stale.
                Ok(Some(job)) if job.status == JobStatus::Processing => {
                    Err(TaskError::Retry(format!("job {job_id} is still processing")))
                }
                _ => Ok(json!({ "job_id": job_id, "skipped": true })),
            },
            Some(AttemptOutcome::Completed { meal_id, result }) => {
                Ok(json!({ "job_id": job_id, "meal_id": meal_id, "result": result }))
            }
            Some(AttemptOutcome::Retrying { error, .. }) => Err(TaskError::Retry(error)),
            Some(AttemptOutcome::Failed { error, .. }) => Err(TaskError::Permanent(error)),
        }
    }

    async fn batch(
        &self,
        task: &Task,
        job_ids: &[Uuid],
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        let report = self
            .worker
            .process_batch(job_ids, ctx)
            .await
            .map_err(|e| TaskError::Retry(e.to_string()))?;

        // Images that failed retryably go back to the broker one by one, with
        // the backoff they would have had as single tasks.
        for item in report.results.iter().filter(|i| i.status == JobStatus::Pending) {
            let attempts = item.retry_count.max(0) as u32;
            let mut retry = Task::new(
                item.job_id.to_string(),
                QueueName::ImageAnalysis,
                serde_json::to_value(AnalysisPayload::Single { job_id: item.job_id })
                    .map_err(|e| TaskError::Retry(e.to_string()))?,
                task.priority,
            );
            retry.attempts_made = attempts;
            retry.max_attempts = task.max_attempts;
            let delay = QueueName::ImageAnalysis.options().backoff.delay_for(attempts);
            if let Err(e) = ctx.broker().enqueue(retry, delay).await {
                tracing::error!(job_id = %item.job_id, error = %e, "Failed to requeue batch item");
            }
        }

        tracing::info!(
            task_id = %task.id,
            success = report.success,
            failed = report.failed,
            "Batch finished"
        );
        serde_json::to_value(&report).map_err(|e| TaskError::Permanent(e.to_string()))
    }
}

#[async_trait]
impl TaskHandler for AnalysisHandler {
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
        let payload: AnalysisPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskError::Permanent(format!("malformed analysis payload: {e}")))?;

        match payload {
            AnalysisPayload::Single { job_id } => self.single(job_id, ctx).await,
            AnalysisPayload::Batch { job_ids } => self.batch(task, &job_ids, ctx).await,
        }
    }
}

/// Runs the recurring cleanup occurrence and queues the next one.
pub struct CleanupHandler {
    store: Arc<dyn JobStore>,
    retention: Duration,
}

impl CleanupHandler {
    pub fn new(store: Arc<dyn JobStore>, retention: Duration) -> Self {
        Self { store, retention }
    }
}

#[async_trait]
impl TaskHandler for CleanupHandler {
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
        let planned: DailyAt = serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskError::Permanent(format!("malformed cleanup payload: {e}")))?;

        let current = ctx
            .broker()
            .schedule(QueueName::Cleanup)
            .await
            .map_err(|e| TaskError::Retry(e.to_string()))?;
        if current != Some(planned) {
            // Superseded by a newer schedule, which has its own occurrence queued.
            return Ok(json!({ "skipped": true }));
        }

        // Chain the next occurrence first so a failed run does not end the series.
        let next_run_at = enqueue_next_cleanup(ctx.broker().as_ref(), planned, Utc::now())
            .await
            .map_err(|e| TaskError::Retry(e.to_string()))?;

        let deleted = run_cleanup(self.store.as_ref(), self.retention)
            .await
            .map_err(|e| TaskError::Retry(e.to_string()))?;

        Ok(json!({ "deleted": deleted, "next_run_at": next_run_at }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::broker::Broker;
    use crate::pipeline::memory::MemoryJobStore;
    use crate::pipeline::retry::RetryPolicy;
    use crate::pipeline::worker::tests::{new_job, salad, MemoryMeals, ScriptedAnalyzer};
    use crate::models::analysis::FoodAnalysis;
    use crate::models::job::AnalysisJob;
    use crate::services::meals::{MealError, MealRecorder};
    use crate::services::memory_queue::MemoryBroker;
    use crate::services::vision::AnalysisError;

    /// Never finishes writing the meal.
    struct HangingMeals;

    #[async_trait]
    impl MealRecorder for HangingMeals {
        async fn record_meal(&self, _job: &AnalysisJob, _analysis: &FoodAnalysis) -> Result<Uuid, MealError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Uuid::new_v4())
        }
    }

    fn single_task(job_id: Uuid) -> Task {
        let payload = serde_json::to_value(AnalysisPayload::Single { job_id }).unwrap();
        Task::new(job_id.to_string(), QueueName::ImageAnalysis, payload, 2)
    }

    fn setup(analyzer: ScriptedAnalyzer) -> (Arc<MemoryJobStore>, Arc<MemoryBroker>, AnalysisHandler) {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new().without_rate_limits());
        let worker = Worker::new(
            store.clone(),
            Arc::new(analyzer),
            Arc::new(MemoryMeals::default()),
            RetryPolicy::default(),
        );
        (store, broker, AnalysisHandler::new(worker))
    }

    fn context(broker: &Arc<MemoryBroker>, task: &Task) -> TaskContext {
        TaskContext::new(broker.clone(), task.queue, task.id.clone())
    }

    #[test]
    fn test_payload_wire_format() {
        let job_id = Uuid::new_v4();
        let value = serde_json::to_value(AnalysisPayload::Single { job_id }).unwrap();
        assert_eq!(value, json!({ "kind": "single", "job_id": job_id }));
        assert_eq!(AnalysisPayload::Single { job_id }.task_id(), job_id.to_string());
    }

    #[tokio::test]
    async fn test_single_task_completes_job() {
        let (store, broker, handler) = setup(ScriptedAnalyzer::always(Ok(salad())));
        let job = store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        let task = Task::new(
            job.id.to_string(),
            QueueName::ImageAnalysis,
            serde_json::to_value(AnalysisPayload::Single { job_id: job.id }).unwrap(),
            1,
        );

        let result = handler.handle(&task, &context(&broker, &task)).await.unwrap();

        assert!(result["meal_id"].is_string());
        let stored = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_single_task_maps_outcomes_to_task_errors() {
        let (store, broker, handler) = setup(ScriptedAnalyzer::then(
            vec![Err(AnalysisError::Http { status: 429, message: "slow down".to_string() })],
            Err(AnalysisError::InvalidImage("unsupported format".to_string())),
        ));
        let job = store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        let payload = serde_json::to_value(AnalysisPayload::Single { job_id: job.id }).unwrap();
        let task = Task::new(job.id.to_string(), QueueName::ImageAnalysis, payload, 2);

        let first = handler.handle(&task, &context(&broker, &task)).await;
        assert!(matches!(first, Err(TaskError::Retry(_))));

        let second = handler.handle(&task, &context(&broker, &task)).await;
        assert!(matches!(second, Err(TaskError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_redelivered_task_for_finished_job_is_skipped() {
        let (store, broker, handler) = setup(ScriptedAnalyzer::always(Ok(salad())));
        let job = store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        let payload = serde_json::to_value(AnalysisPayload::Single { job_id: job.id }).unwrap();
        let task = Task::new(job.id.to_string(), QueueName::ImageAnalysis, payload, 2);

        handler.handle(&task, &context(&broker, &task)).await.unwrap();
        let again = handler.handle(&task, &context(&broker, &task)).await.unwrap();

        assert_eq!(again["skipped"], json!(true));
    }

    #[tokio::test]
    async fn test_batch_requeues_retryable_items() {
        let (store, broker, handler) = setup(ScriptedAnalyzer::then(
            vec![
                Ok(salad()),
                Err(AnalysisError::Http { status: 503, message: "busy".to_string() }),
                Err(AnalysisError::InvalidImage("unsupported format".to_string())),
            ],
            Ok(salad()),
        ));
        let owner = Uuid::new_v4();
        let mut job_ids = Vec::new();
        for _ in 0..3 {
            job_ids.push(store.create_job(new_job(owner)).await.unwrap().id);
        }
        let payload = serde_json::to_value(AnalysisPayload::Batch { job_ids: job_ids.clone() }).unwrap();
        let task = Task::new("batch:1", QueueName::ImageAnalysis, payload, 1);

        let result = handler.handle(&task, &context(&broker, &task)).await.unwrap();

        assert_eq!(result["success"], json!(1));
        assert_eq!(result["failed"], json!(2));
        assert_eq!(result["results"].as_array().unwrap().len(), 3);

        let requeued = broker.task(QueueName::ImageAnalysis, &job_ids[1].to_string()).await.unwrap();
        assert_eq!(requeued.attempts_made, 1);
        assert!(broker.task(QueueName::ImageAnalysis, &job_ids[2].to_string()).await.is_none());
        assert_eq!(broker.stats(QueueName::ImageAnalysis).await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_permanent() {
        let (_, broker, handler) = setup(ScriptedAnalyzer::always(Ok(salad())));
        let task = Task::new("junk", QueueName::ImageAnalysis, json!({"kind": "video"}), 2);

        let outcome = handler.handle(&task, &context(&broker, &task)).await;
        assert!(matches!(outcome, Err(TaskError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_cleanup_chains_next_occurrence() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let schedule = DailyAt::new(3, 0).unwrap();
        broker.set_schedule(QueueName::Cleanup, schedule).await.unwrap();

        let handler = CleanupHandler::new(store, Duration::from_secs(7 * 24 * 3600));
        let task = Task::new("cleanup:now", QueueName::Cleanup, serde_json::to_value(schedule).unwrap(), 1);
        let result = handler.handle(&task, &context(&broker, &task)).await.unwrap();

        assert_eq!(result["deleted"], json!(0));
        assert_eq!(broker.stats(QueueName::Cleanup).await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_superseded_cleanup_does_not_chain() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        broker.set_schedule(QueueName::Cleanup, DailyAt::new(4, 30).unwrap()).await.unwrap();

        let handler = CleanupHandler::new(store, Duration::from_secs(60));
        let stale = serde_json::to_value(DailyAt::new(3, 0).unwrap()).unwrap();
        let task = Task::new("cleanup:old", QueueName::Cleanup, stale, 1);
        let result = handler.handle(&task, &context(&broker, &task)).await.unwrap();

        assert_eq!(result["skipped"], json!(true));
        assert_eq!(broker.stats(QueueName::Cleanup).await.unwrap().delayed, 0);
    }

    #[tokio::test]
    async fn test_hung_meal_write_is_settled_as_retry() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let worker = Worker::new(
            store.clone(),
            Arc::new(ScriptedAnalyzer::always(Ok(salad()))),
            Arc::new(HangingMeals),
            RetryPolicy::default(),
        )
        .with_attempt_timeout(Some(Duration::from_millis(30)));
        let handler = AnalysisHandler::new(worker);

        let job = store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        let task = single_task(job.id);
        let outcome = handler.handle(&task, &context(&broker, &task)).await;

        assert!(matches!(outcome, Err(TaskError::Retry(_))));
        let stored = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!((stored.status, stored.retry_count), (JobStatus::Pending, 1));
    }

    #[tokio::test]
    async fn test_redelivery_recovers_job_abandoned_in_processing() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let worker = Worker::new(
            store.clone(),
            Arc::new(ScriptedAnalyzer::always(Ok(salad()))),
            Arc::new(MemoryMeals::default()),
            RetryPolicy::default(),
        )
        .with_stale_after(Some(Duration::from_millis(50)));
        let handler = AnalysisHandler::new(worker);

        // An earlier attempt claimed the row and then vanished.
        let job = store.create_job(new_job(Uuid::new_v4())).await.unwrap();
        store.mark_processing(job.id).await.unwrap();
        let task = single_task(job.id);

        let early = handler.handle(&task, &context(&broker, &task)).await;
        assert!(matches!(early, Err(TaskError::Retry(_))));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let result = handler.handle(&task, &context(&broker, &task)).await.unwrap();
        assert!(result["meal_id"].is_string());

        let stored = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!((stored.status, stored.retry_count), (JobStatus::Completed, 1));
    }
}
