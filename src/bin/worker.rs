use defect_scan::{
    config::AppConfig,
    db,
    services::{
        dispatcher::AnalysisDispatcher,
        queue::{JobQueue, RedisJobQueue},
        registry::{JobRegistry, PgJobRegistry},
        supervisor::Supervisor,
        worker::Worker,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
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

    tracing::info!("Starting defect analysis worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.worker_metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        tracing::info!(%addr, "Serving worker metrics");
    }
    metrics::describe_histogram!(
        "analysis_processing_seconds",
        "Time to analyze one job"
    );
    metrics::describe_counter!(
        "analysis_jobs_completed_total",
        "Total analysis jobs completed"
    );
    metrics::describe_counter!(
        "analysis_jobs_failed_total",
        "Total analysis jobs that failed"
    );
    metrics::describe_counter!(
        "analysis_jobs_recovered_total",
        "Stalled jobs redelivered or timed out by the supervisor"
    );

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.worker_pool_size())
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize services
    tracing::info!("Initializing services");
    let registry: Arc<dyn JobRegistry> = Arc::new(PgJobRegistry::new(db_pool, config.result_ttl()));
    let queue: Arc<dyn JobQueue> =
        Arc::new(RedisJobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));
    let dispatcher = Arc::new(AnalysisDispatcher::new(config.video_options()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Supervisor::new(queue.clone(), registry.clone(), config.supervisor());
    let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx.clone()));

    let worker = Worker::new(queue, registry, dispatcher, config.dequeue_wait());
    let slots: Vec<_> = (0..config.worker_concurrency)
        .map(|slot| tokio::spawn(worker.clone().run(slot, shutdown_rx.clone())))
        .collect();

    tracing::info!(
        slots = config.worker_concurrency,
        frame_stride = config.frame_stride,
        max_frames = config.max_frames,
        "Worker ready, starting job processing loop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested, finishing in-flight jobs");
    let _ = shutdown_tx.send(true);

    for slot in slots {
        if let Err(e) = slot.await {
            tracing::error!(error = %e, "Worker slot panicked");
        }
    }
    let _ = supervisor_task.await;
    tracing::info!("Worker stopped");
}
