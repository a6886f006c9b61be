use meal_analysis::{
    config::AppConfig,
    db,
    pipeline::{broker::Broker, store::PgJobStore, Pipeline, SchedulerMode},
    services::{meals::PgMealRecorder, queue::RedisBroker, vision::WorkersAiClient},
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let pipeline_config = config.pipeline().expect("Invalid pipeline configuration");

    tracing::info!(scheduler = %pipeline_config.mode, "Starting analysis worker");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    let broker: Option<Arc<dyn Broker>> = match (pipeline_config.mode, config.redis_url.as_deref()) {
        (SchedulerMode::Broker, Some(url)) => {
            Some(Arc::new(RedisBroker::new(url).expect("Failed to initialize Redis broker")))
        }
        (SchedulerMode::Broker, None) => panic!("REDIS_URL is required in broker mode"),
        (SchedulerMode::Polling, _) => None,
    };

    let analyzer = WorkersAiClient::with_model(&config.cf_account_id, &config.cf_api_token, &config.vision_model)
        .expect("Failed to initialize Workers AI client");

    let pipeline = Pipeline::new(
        pipeline_config,
        Arc::new(PgJobStore::new(db_pool.clone())),
        Arc::new(analyzer),
        Arc::new(PgMealRecorder::new(db_pool)),
        broker,
    )
    .expect("Failed to assemble pipeline");

    match pipeline.ensure_cleanup_schedule().await {
        Ok(next_run_at) => tracing::info!(next_run_at = %next_run_at, "Cleanup scheduled"),
        Err(e) => tracing::error!(error = %e, "Failed to schedule cleanup"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let maintenance = pipeline.maintenance().map(|maintenance| {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { maintenance.run(shutdown).await })
    });

    let scheduler = Arc::clone(pipeline.scheduler());
    let runner = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tracing::info!("Worker ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested, draining in-flight jobs");
    let _ = shutdown_tx.send(true);

    if let Err(e) = runner.await {
        tracing::error!(error = %e, "Scheduler task panicked");
    }
    if let Some(handle) = maintenance {
        let _ = handle.await;
    }

    tracing::info!("Worker stopped");
}
