use async_trait::async_trait;
use meal_analysis::{
    db,
    models::analysis::{FoodAnalysis, Nutrition},
    models::job::{AnalysisJob, JobStatus, MealType, NewAnalysisJob},
    models::queue::{QueueName, SubscriptionTier, Task},
    pipeline::{
        broker::Broker, memory::MemoryJobStore, store::JobStore, store::PgJobStore, Pipeline,
        PipelineConfig,
    },
    services::{
        meals::{MealError, MealRecorder, PgMealRecorder},
        queue::RedisBroker,
        vision::{AnalysisError, VisionAnalyzer},
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

const LEASE: Duration = Duration::from_secs(60);

const PNG_HEADER: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

fn soup() -> FoodAnalysis {
    FoodAnalysis {
        dish_name: "Tomato Soup".to_string(),
        items: Vec::new(),
        nutrition: Nutrition {
            calories: 180.0,
            protein_g: 4.0,
            carbs_g: 22.0,
            fat_g: 8.0,
            fiber_g: None,
        },
        confidence: 0.8,
        notes: None,
    }
}

fn new_job(owner: Uuid) -> NewAnalysisJob {
    NewAnalysisJob {
        user_id: owner,
        image_ref: "lunch.png".to_string(),
        image_content_type: "image/png".to_string(),
        image_data: PNG_HEADER.to_vec(),
        meal_type: MealType::Lunch,
        expires_at: None,
    }
}

struct FixedAnalyzer;

#[async_trait]
impl VisionAnalyzer for FixedAnalyzer {
    async fn analyze(&self, _image: &[u8], _meal_type: MealType) -> Result<FoodAnalysis, AnalysisError> {
        Ok(soup())
    }
}

#[derive(Default)]
struct CountingMeals {
    recorded: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl MealRecorder for CountingMeals {
    async fn record_meal(&self, job: &AnalysisJob, _analysis: &FoodAnalysis) -> Result<Uuid, MealError> {
        self.recorded.lock().await.push(job.id);
        Ok(Uuid::new_v4())
    }
}

async fn pg_store() -> PgJobStore {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = db::init_pool(&database_url).await.expect("Failed to connect to database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");
    PgJobStore::new(pool)
}

/// Polling pipeline against the in-memory store: submit, run, observe the
/// completed job through the owner-scoped read.
#[tokio::test]
async fn test_polling_pipeline_completes_submitted_job() {
    let store = Arc::new(MemoryJobStore::new());
    let meals = Arc::new(CountingMeals::default());
    let config = PipelineConfig {
        poll_interval: Duration::from_millis(10),
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(config, store.clone(), Arc::new(FixedAnalyzer), meals.clone(), None)
        .expect("Failed to assemble pipeline");

    let owner = Uuid::new_v4();
    let job = pipeline
        .submit(new_job(owner), SubscriptionTier::Free)
        .await
        .expect("Failed to submit");

    let (tx, rx) = watch::channel(false);
    let scheduler = Arc::clone(pipeline.scheduler());
    let runner = tokio::spawn(async move { scheduler.run(rx).await });

    let mut finished = None;
    for _ in 0..100 {
        let current = store.get_job(job.id, owner).await.unwrap().unwrap();
        if current.status.is_terminal() {
            finished = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    runner.await.unwrap();

    let finished = finished.expect("job did not finish");
    assert_eq!(finished.status, JobStatus::Completed);
    assert!(finished.produced_meal_id.is_some());
    assert_eq!(finished.result, Some(serde_json::to_value(soup()).unwrap()));
    assert_eq!(meals.recorded.lock().await.as_slice(), &[job.id]);

    // Another caller cannot tell the job exists.
    assert!(store.get_job(job.id, Uuid::new_v4()).await.unwrap().is_none());
}

/// Several claimers racing for one pending row: exactly one wins.
///
/// Note: This requires a running PostgreSQL instance (DATABASE_URL).
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_postgres_claim_skips_locked_rows() {
    let store = pg_store().await;
    let job = store.create_job(new_job(Uuid::new_v4())).await.expect("Failed to create job");

    let claims = futures::future::join_all((0..4).map(|_| store.claim_pending(1, None))).await;
    let claimed: Vec<_> = claims
        .into_iter()
        .flat_map(|claim| claim.expect("Claim query failed"))
        .filter(|j| j.id == job.id)
        .collect();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, JobStatus::Processing);
    assert!(claimed[0].started_at.is_some());
}

/// Create, read, fail, retry, complete against PostgreSQL.
#[tokio::test]
#[ignore]
async fn test_postgres_job_lifecycle() {
    let store = pg_store().await;
    let owner = Uuid::new_v4();
    let job = store.create_job(new_job(owner)).await.expect("Failed to create job");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);

    assert_eq!(store.load_image(job.id).await.unwrap().as_deref(), Some(PNG_HEADER));
    assert!(store.get_job(job.id, Uuid::new_v4()).await.unwrap().is_none());

    let processing = store.mark_processing(job.id).await.unwrap().expect("job should be pending");
    assert!(store.mark_processing(job.id).await.unwrap().is_none());

    store
        .record_failure(job.id, "HTTP 503", 1, JobStatus::Pending)
        .await
        .expect("Failed to record failure");
    let retried = store.get_job(job.id, owner).await.unwrap().unwrap();
    assert_eq!((retried.status, retried.retry_count), (JobStatus::Pending, 1));
    assert_eq!(retried.started_at, processing.started_at);

    store.mark_processing(job.id).await.unwrap().expect("job should be pending again");

    let recorder = PgMealRecorder::new(store.pool().clone());
    let current = store.find_job(job.id).await.unwrap().unwrap();
    let meal_id = recorder.record_meal(&current, &soup()).await.expect("Failed to record meal");
    let again = recorder.record_meal(&current, &soup()).await.expect("Failed to record meal");
    assert_eq!(meal_id, again);

    let result = serde_json::to_value(soup()).unwrap();
    store.complete_job(job.id, &result, meal_id).await.expect("Failed to complete job");

    let done = store.get_job(job.id, owner).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.produced_meal_id, Some(meal_id));
    assert!(done.completed_at.is_some());

    // Terminal rows are never written again.
    assert!(store.record_failure(job.id, "late", 2, JobStatus::Failed).await.is_err());
}

/// Priority, pause and clear on a real Redis broker.
///
/// Note: This requires a running Redis instance (REDIS_URL).
#[tokio::test]
#[ignore]
async fn test_redis_broker_queue_controls() {
    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
    let broker = RedisBroker::new(&redis_url).expect("Failed to initialize broker");
    broker.ping().await.expect("Redis is not reachable");

    let queue = QueueName::Webhook;
    broker.resume(queue).await.unwrap();
    broker.clear(queue).await.unwrap();

    let run = Uuid::new_v4();
    for (name, priority) in [("low", 3), ("high", 1), ("mid", 2)] {
        let task = Task::new(format!("{run}:{name}"), queue, serde_json::json!({ "n": name }), priority);
        assert!(broker.enqueue(task.clone(), Duration::ZERO).await.unwrap());
        assert!(!broker.enqueue(task, Duration::ZERO).await.unwrap());
    }

    let first = broker.reserve(queue, LEASE).await.unwrap().expect("task expected");
    assert_eq!(first.id, format!("{run}:high"));
    broker.report_progress(queue, &first.id, 50).await.unwrap();
    broker.complete(queue, &first.id, &serde_json::json!({ "ok": true })).await.unwrap();

    broker.pause(queue).await.unwrap();
    assert!(broker.reserve(queue, LEASE).await.unwrap().is_none());
    let stats = broker.stats(queue).await.unwrap();
    assert!(stats.is_paused);
    assert_eq!((stats.waiting, stats.paused), (0, 2));

    broker.resume(queue).await.unwrap();
    let second = broker.reserve(queue, LEASE).await.unwrap().expect("task expected");
    assert_eq!(second.id, format!("{run}:mid"));
    broker.fail(queue, &second.id, "boom").await.unwrap();
    // Failed tasks from earlier runs may be re-admitted as well.
    assert!(broker.retry_failed(queue, 10).await.unwrap() >= 1);

    assert!(broker.clear(queue).await.unwrap() >= 2);
}

/// A reserved task that is never settled comes back once its lease lapses.
///
/// Note: This requires a running Redis instance (REDIS_URL).
#[tokio::test]
#[ignore]
async fn test_redis_broker_redelivers_lapsed_lease() {
    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
    let broker = RedisBroker::new(&redis_url).expect("Failed to initialize broker");

    let queue = QueueName::Email;
    broker.resume(queue).await.unwrap();
    broker.clear(queue).await.unwrap();

    let id = format!("{}:orphan", Uuid::new_v4());
    broker
        .enqueue(Task::new(id.clone(), queue, serde_json::json!({}), 2), Duration::ZERO)
        .await
        .unwrap();
    let held = broker
        .reserve(queue, Duration::from_millis(50))
        .await
        .unwrap()
        .expect("task expected");
    assert_eq!(held.id, id);
    assert!(broker.reserve(queue, LEASE).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let again = broker.reserve(queue, LEASE).await.unwrap().expect("task redelivered");
    assert_eq!(again.id, id);
    assert_eq!(again.attempts_made, 1);

    broker.complete(queue, &again.id, &serde_json::json!({})).await.unwrap();
    assert_eq!(broker.stats(queue).await.unwrap().active, 0);
}
