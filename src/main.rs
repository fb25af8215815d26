use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use defect_scan::{
    app::build_router,
    app_state::AppState,
    config::AppConfig,
    db,
    services::{queue::RedisJobQueue, registry::PgJobRegistry, staging::UploadStaging},
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

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing defect-scan server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "analysis_jobs_submitted_total",
        "Total analysis jobs submitted"
    );
    metrics::describe_gauge!(
        "analysis_queue_depth",
        "Current number of pending jobs in the queue"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let registry = PgJobRegistry::new(db_pool, config.result_ttl());

    // Initialize Redis job queue
    tracing::info!("Connecting to Redis job queue");
    let queue = RedisJobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    let staging = UploadStaging::new(config.uploads_dir())
        .await
        .expect("Failed to create upload staging directory");
    tracing::info!(dir = %staging.dir().display(), "Staging uploads");

    // Create shared application state
    let state = AppState::new(
        Arc::new(registry),
        Arc::new(queue),
        staging,
        config.max_upload_bytes(),
    );

    let app = build_router(state, Some(prometheus_handle));

    tracing::info!("Starting defect-scan on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
