//! HTTP API tests driving the router in-process with in-memory backends.
//!
//! Run with: cargo test --test http_api

mod helpers;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use async_trait::async_trait;
use axum::Router;
use helpers::*;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use defect_scan::app::build_router;
use defect_scan::app_state::AppState;
use defect_scan::services::dispatcher::AnalysisDispatcher;
use defect_scan::services::queue::{InMemoryJobQueue, JobQueue, QueueError, QueuedJob};
use defect_scan::services::staging::UploadStaging;
use defect_scan::services::worker::{Processed, Worker};

const BOUNDARY: &str = "defect-scan-test-boundary";

struct TestApp {
    router: Router,
    pipeline: Pipeline,
    uploads: PathBuf,
    _dir: tempfile::TempDir,
}

async fn test_app(max_upload_bytes: usize) -> TestApp {
    let pipeline = Pipeline::new();
    let queue = pipeline.queue.clone();
    test_app_with_queue(pipeline, queue, max_upload_bytes).await
}

async fn test_app_with_queue(
    pipeline: Pipeline,
    queue: Arc<dyn JobQueue>,
    max_upload_bytes: usize,
) -> TestApp {
    build_test_app(pipeline, queue, max_upload_bytes, None).await
}

async fn build_test_app(
    pipeline: Pipeline,
    queue: Arc<dyn JobQueue>,
    max_upload_bytes: usize,
    prometheus: Option<Arc<PrometheusHandle>>,
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let uploads = dir.path().join("uploads");
    let staging = UploadStaging::new(&uploads).await.unwrap();
    let state = AppState::new(pipeline.registry.clone(), queue, staging, max_upload_bytes);
    TestApp {
        router: build_router(state, prometheus),
        pipeline,
        uploads,
        _dir: dir,
    }
}

/// Accepts the first `accept` enqueues, then reports the queue as down.
struct FlakyQueue {
    inner: InMemoryJobQueue,
    accept: usize,
    enqueued: AtomicUsize,
}

impl FlakyQueue {
    fn new(accept: usize) -> Self {
        Self {
            inner: InMemoryJobQueue::new(),
            accept,
            enqueued: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        if self.enqueued.fetch_add(1, Ordering::SeqCst) >= self.accept {
            return Err(QueueError::Poisoned);
        }
        self.inner.enqueue(job).await
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>, QueueError> {
        self.inner.dequeue(wait).await
    }

    async fn ack(&self, job: &QueuedJob) -> Result<(), QueueError> {
        self.inner.ack(job).await
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<Vec<QueuedJob>, QueueError> {
        self.inner.reclaim_stale(older_than).await
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        self.inner.depth().await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.inner.health_check().await
    }
}

fn multipart_body(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, data) in files {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(files: &[(&str, &[u8])]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(files)))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_upload_then_poll_until_success() {
    let app = test_app(1024 * 1024).await;
    let png = png_bytes(&clean_image(32, 32));

    let (status, body) = send(&app.router, upload_request(&[("part.png", png.as_slice())])).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["filename"], "part.png");
    let job_id = jobs[0]["job_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app.router, get(&format!("/api/status/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "PENDING");
    assert_eq!(body["progress"], 0);

    let (status, body) = send(&app.router, get(&format!("/api/result/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], false);
    assert_eq!(body["state"], "PENDING");

    app.pipeline.worker.process_next_job().await.unwrap();

    let (status, body) = send(&app.router, get(&format!("/api/status/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "SUCCESS");
    assert_eq!(body["progress"], 100);
    assert_eq!(body["result"]["type"], "image");

    let (status, body) = send(&app.router, get(&format!("/api/result/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
    assert_eq!(body["result"]["defect_detected"], false);
    assert!(body["result"]["image_base64"].is_string());
}

#[tokio::test]
async fn test_upload_creates_one_job_per_file() {
    let app = test_app(1024 * 1024).await;
    let clean = png_bytes(&clean_image(16, 16));
    let red = png_bytes(&red_image(16, 16));

    let (status, body) = send(
        &app.router,
        upload_request(&[("a.png", clean.as_slice()), ("b.PNG", red.as_slice())]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_ne!(jobs[0]["job_id"], jobs[1]["job_id"]);
}

#[tokio::test]
async fn test_queue_outage_rolls_back_whole_upload() {
    let queue = Arc::new(FlakyQueue::new(1));
    let app = test_app_with_queue(Pipeline::new(), queue.clone(), 1024 * 1024).await;
    let clean = png_bytes(&clean_image(16, 16));

    let (status, body) = send(
        &app.router,
        upload_request(&[("a.png", clean.as_slice()), ("b.png", clean.as_slice())]),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ok"], false);
    assert_eq!(app.pipeline.registry.job_count(), 0);
    assert_eq!(std::fs::read_dir(&app.uploads).unwrap().count(), 0);

    // The first file made it onto the queue; its delivery is dropped.
    assert_eq!(queue.depth().await.unwrap(), 1);
    let worker = Worker::new(
        queue.clone(),
        app.pipeline.registry.clone(),
        Arc::new(AnalysisDispatcher::default()),
        TEST_DEQUEUE_WAIT,
    );
    assert!(matches!(
        worker.process_next_job().await.unwrap(),
        Processed::Skipped { .. }
    ));
    assert_eq!(queue.inner.in_flight(), 0);
}

#[tokio::test]
async fn test_unsupported_upload_is_rejected() {
    let app = test_app(1024 * 1024).await;

    let (status, body) = send(&app.router, upload_request(&[("notes.txt", &b"hello"[..])])).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "Unsupported file type: .txt");
}

#[tokio::test]
async fn test_empty_upload_is_rejected() {
    let app = test_app(1024 * 1024).await;

    let (status, body) = send(&app.router, upload_request(&[])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let app = test_app(16).await;
    let data = [0u8; 100];

    let (status, body) = send(&app.router, upload_request(&[("big.png", &data[..])])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn test_failed_job_result_is_server_error() {
    let app = test_app(1024 * 1024).await;

    let (_, body) = send(
        &app.router,
        upload_request(&[("broken.jpg", &b"definitely not a jpeg"[..])]),
    )
    .await;
    let job_id = body["jobs"][0]["job_id"].as_str().unwrap().to_string();
    app.pipeline.worker.process_next_job().await.unwrap();

    let (status, body) = send(&app.router, get(&format!("/api/status/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "FAILURE");
    assert!(body.get("progress").is_none());
    assert!(body["error"].as_str().unwrap().starts_with("Unable to read image"));

    let (status, body) = send(&app.router, get(&format!("/api/result/{job_id}"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["ready"], true);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let app = test_app(1024 * 1024).await;
    let job_id = Uuid::new_v4();

    let (status, body) = send(&app.router, get(&format!("/api/status/{job_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], false);

    let (status, _) = send(&app.router, get(&format!("/api/result/{job_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_reports_ok() {
    let app = test_app(1024 * 1024).await;

    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["registry"]["status"], "ok");
    assert_eq!(body["checks"]["queue"]["status"], "ok");
}

#[tokio::test]
async fn test_metrics_scrape_reports_queue_depth() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = Arc::new(recorder.handle());
    let _local = metrics::set_default_local_recorder(&recorder);

    let pipeline = Pipeline::new();
    let queue = pipeline.queue.clone();
    let app = build_test_app(pipeline, queue, 1024 * 1024, Some(handle)).await;
    let png = png_bytes(&clean_image(16, 16));
    let (status, _) = send(
        &app.router,
        upload_request(&[("a.png", png.as_slice()), ("b.png", png.as_slice())]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let response = app.router.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("analysis_queue_depth 2"), "{text}");
    assert!(text.contains("analysis_jobs_submitted_total 2"), "{text}");
}

#[tokio::test]
async fn test_metrics_not_mounted_without_handle() {
    let app = test_app(1024 * 1024).await;
    let response = app.router.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
