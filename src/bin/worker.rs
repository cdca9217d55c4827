use axum::{routing::get, Router};
use bulk_verify::{
    app_state::AppState,
    config::AppConfig,
    db,
    routes,
    services::{
        classifier::{Classifier, HttpClassifier},
        lease::RedisWorkspaceLease,
        ledger::{CreditLedger, PgCreditLedger},
        queue::{RedisJobQueue, WorkQueue},
        store::{JobStore, PgJobStore},
    },
    worker::{BulkJobWorker, Reaper, WorkerService},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
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

    tracing::info!("Starting bulk verification worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let settings = config.worker_settings();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("bulk_jobs_submitted_total", "Bulk jobs accepted for processing");
    metrics::describe_counter!("bulk_jobs_started_total", "Bulk jobs moved to processing");
    metrics::describe_counter!("bulk_jobs_completed_total", "Bulk jobs completed");
    metrics::describe_counter!("bulk_jobs_failed_total", "Bulk jobs that failed");
    metrics::describe_counter!("bulk_jobs_retried_total", "Bulk job attempts re-queued after an infrastructure error");
    metrics::describe_counter!("bulk_jobs_reaped_total", "Stalled bulk jobs requeued by the reaper");
    metrics::describe_counter!("bulk_credit_exhaustions_total", "Bulk jobs stopped by insufficient credits");
    metrics::describe_counter!("bulk_addresses_processed_total", "Addresses classified, by verdict");
    metrics::describe_histogram!("bulk_job_duration_seconds", "Wall-clock time of a bulk job attempt");
    metrics::describe_gauge!("bulk_queue_depth", "Bulk jobs waiting in the queue");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing services");
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool.clone()));
    let ledger: Arc<dyn CreditLedger> = Arc::new(PgCreditLedger::new(db_pool));
    let queue: Arc<dyn WorkQueue> = Arc::new(
        RedisJobQueue::new(&config.redis_url, config.history_retention)
            .expect("Failed to initialize job queue"),
    );
    let lease = Arc::new(
        RedisWorkspaceLease::new(&config.redis_url).expect("Failed to initialize workspace lease"),
    );
    let classifier: Arc<dyn Classifier> = Arc::new(
        HttpClassifier::new(
            &config.classifier_url,
            &config.classifier_api_token,
            Duration::from_millis(config.classifier_timeout_ms),
            ledger,
        )
        .expect("Failed to initialize classifier client"),
    );

    let worker = BulkJobWorker::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        classifier,
        lease,
        settings.clone(),
    );
    let reaper = Reaper::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        settings.stale_after,
        settings.reaper_interval,
        settings.max_reaps,
    );
    let handle = WorkerService::new(worker, reaper).start();

    // Operational endpoints
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .with_state(AppState::new(store, queue))
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!("Ops server listening on {}", config.bind_addr);

    let shutdown = handle.shutdown_token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested");

    handle.stop().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Ops server error"),
        Err(e) => tracing::error!(error = %e, "Ops server task failed"),
    }
}
