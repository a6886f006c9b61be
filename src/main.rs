use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use meal_analysis::{
    app_state::AppState,
    auth::JwtVerifier,
    config::AppConfig,
    db,
    pipeline::{broker::Broker, store::PgJobStore, Pipeline, SchedulerMode},
    routes,
    services::{meals::PgMealRecorder, queue::RedisBroker, vision::WorkersAiClient},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let pipeline_config = config.pipeline().expect("Invalid pipeline configuration");

    tracing::info!(scheduler = %pipeline_config.mode, "Initializing meal-analysis server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("analysis_jobs_submitted_total", "Analysis jobs submitted");
    metrics::describe_counter!("analysis_jobs_completed_total", "Analysis jobs completed");
    metrics::describe_counter!(
        "analysis_jobs_retried_total",
        "Failed analysis attempts returned to pending, by error category"
    );
    metrics::describe_counter!(
        "analysis_jobs_failed_total",
        "Analysis jobs that failed terminally, by error category"
    );
    metrics::describe_histogram!(
        "analysis_processing_seconds",
        "Time from an attempt starting to the job completing"
    );
    metrics::describe_gauge!("queue_depth", "Waiting plus delayed tasks per broker queue");

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let broker: Option<Arc<dyn Broker>> = match (pipeline_config.mode, config.redis_url.as_deref()) {
        (SchedulerMode::Broker, Some(url)) => {
            tracing::info!("Connecting to Redis broker");
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
        Arc::new(PgMealRecorder::new(db_pool.clone())),
        broker.clone(),
    )
    .expect("Failed to assemble pipeline");

    let state = AppState::new(db_pool, pipeline, JwtVerifier::new(&config.jwt_secret), broker);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/jobs",
            post(routes::jobs::submit_job).get(routes::jobs::list_jobs),
        )
        .route("/api/v1/jobs/batch", post(routes::jobs::submit_batch))
        .route("/api/v1/jobs/{job_id}", get(routes::jobs::get_job))
        .route("/api/v1/admin/queues", get(routes::admin::queue_stats))
        .route("/api/v1/admin/queues/{name}/pause", post(routes::admin::pause_queue))
        .route("/api/v1/admin/queues/{name}/resume", post(routes::admin::resume_queue))
        .route("/api/v1/admin/queues/{name}/retry", post(routes::admin::retry_failed))
        .route("/api/v1/admin/queues/{name}/clear", post(routes::admin::clear_queue))
        .route("/api/v1/admin/cleanup", post(routes::admin::schedule_cleanup))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(25 * 1024 * 1024)); // room for a 10-image batch

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
