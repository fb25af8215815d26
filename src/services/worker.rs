use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::models::analysis::{AnalysisReport, ResultPayload, VideoMeta};
use crate::models::job::{JobOutcome, JobState};
use crate::services::dispatcher::AnalysisDispatcher;
use crate::services::error::AnalysisError;
use crate::services::queue::{JobQueue, QueueError, QueuedJob};
use crate::services::registry::{JobRegistry, RegistryError};

/// JPEG quality for annotated previews.
pub const PREVIEW_JPEG_QUALITY: u8 = 90;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// What happened to one dequeued job.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// Nothing arrived within the dequeue wait.
    Idle,
    Finished { job_id: uuid::Uuid, state: JobState },
    /// Delivery for a job that is already terminal, or whose claim moved on.
    Skipped { job_id: uuid::Uuid },
}

/// Pulls jobs, runs analysis and records the outcome.
#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    registry: Arc<dyn JobRegistry>,
    dispatcher: Arc<AnalysisDispatcher>,
    dequeue_wait: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<dyn JobRegistry>,
        dispatcher: Arc<AnalysisDispatcher>,
        dequeue_wait: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            dispatcher,
            dequeue_wait,
        }
    }

    /// Process jobs until `shutdown` flips to true. Shutdown is observed
    /// between jobs, so the job in flight always runs to completion.
    pub async fn run(self, slot: usize, shutdown: watch::Receiver<bool>) {
        tracing::info!(slot, "Worker slot ready");
        while !*shutdown.borrow() {
            match self.process_next_job().await {
                Ok(Processed::Idle) => tracing::trace!(slot, "No jobs available"),
                Ok(outcome) => tracing::debug!(slot, ?outcome, "Job handled, checking for next job"),
                Err(e) => {
                    tracing::error!(slot, error = %e, "Error processing job, will retry");
                    tokio::time::sleep(self.dequeue_wait).await;
                }
            }
        }
        tracing::info!(slot, "Worker slot stopped");
    }

    /// Process the next job from the queue.
    pub async fn process_next_job(&self) -> Result<Processed, WorkerError> {
        let Some(job) = self.queue.dequeue(self.dequeue_wait).await? else {
            return Ok(Processed::Idle);
        };

        tracing::info!(
            job_id = %job.job_id,
            delivery_id = %job.delivery_id,
            file_path = %job.file_path,
            "Processing analysis job"
        );

        let claim = match self.registry.claim(job.job_id).await {
            Ok(claim) => claim,
            Err(RegistryError::AlreadyFinished { job_id, state }) => {
                tracing::warn!(job_id = %job_id, state = %state, "Duplicate delivery of finished job");
                self.queue.ack(&job).await?;
                return Ok(Processed::Skipped { job_id });
            }
            Err(RegistryError::NotFound(job_id)) => {
                tracing::warn!(job_id = %job_id, "Dropping delivery for unknown or expired job");
                self.queue.ack(&job).await?;
                return Ok(Processed::Skipped { job_id });
            }
            Err(e) => return Err(e.into()),
        };

        let start = Instant::now();
        let outcome = match self.analyze(&job, start).await {
            Ok(payload) => {
                tracing::info!(
                    job_id = %job.job_id,
                    kind = %payload.kind,
                    defect_detected = payload.defect_detected,
                    elapsed_ms = payload.elapsed_ms,
                    attempt = claim.attempt,
                    "Job completed successfully"
                );
                metrics::counter!("analysis_jobs_completed_total").increment(1);
                JobOutcome::Success(payload)
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job.job_id,
                    file_path = %job.file_path,
                    kind = e.kind(),
                    error = %e,
                    "Job processing failed"
                );
                metrics::counter!("analysis_jobs_failed_total", "kind" => e.kind()).increment(1);
                JobOutcome::Failure(e.to_string())
            }
        };
        metrics::histogram!("analysis_processing_seconds").record(start.elapsed().as_secs_f64());

        let state = outcome.state();
        match self.registry.finish(&claim, outcome).await {
            Ok(()) => {}
            Err(RegistryError::ClaimLost(job_id)) => {
                tracing::warn!(job_id = %job_id, delivery_id = %job.delivery_id, "Claim was taken over before finishing; discarding outcome");
                // Releases only this delivery; the one that took over stays claimed.
                self.queue.ack(&job).await?;
                return Ok(Processed::Skipped { job_id });
            }
            Err(e) => return Err(e.into()),
        }
        self.queue.ack(&job).await?;

        Ok(Processed::Finished {
            job_id: job.job_id,
            state,
        })
    }

    /// Run the blocking analysis off the async runtime and encode its payload.
    async fn analyze(&self, job: &QueuedJob, start: Instant) -> Result<ResultPayload, AnalysisError> {
        let dispatcher = self.dispatcher.clone();
        let path = PathBuf::from(&job.file_path);
        let file_path = job.file_path.clone();

        tokio::task::spawn_blocking(move || {
            let report = dispatcher.dispatch(&path)?;
            encode_payload(report, file_path, start)
        })
        .await
        .map_err(|e| AnalysisError::Internal(e.to_string()))?
    }
}

/// Build the SUCCESS payload. Metrics are copied from the report before the
/// preview is encoded.
pub fn encode_payload(
    report: AnalysisReport,
    file_path: String,
    start: Instant,
) -> Result<ResultPayload, AnalysisError> {
    let kind = report.kind();
    let defect_detected = report.defect_detected();

    let (metrics, image_base64, meta) = match report {
        AnalysisReport::Image(image) => {
            let metrics = BTreeMap::from([
                ("laplacian_var".to_string(), image.metrics.sharpness),
                ("edge_density".to_string(), image.metrics.edge_density),
                ("red_ratio".to_string(), image.metrics.color_anomaly_ratio),
                ("defect_score".to_string(), image.defect_score),
            ]);
            let encoded = encode_jpeg_base64(&image.annotated)?;
            (metrics, Some(encoded), None)
        }
        AnalysisReport::Video(video) => {
            let metrics = BTreeMap::from([
                ("mean_laplacian_var".to_string(), video.mean_metrics.sharpness),
                ("mean_edge_density".to_string(), video.mean_metrics.edge_density),
                ("mean_red_ratio".to_string(), video.mean_metrics.color_anomaly_ratio),
                ("defect_ratio".to_string(), video.defect_ratio),
            ]);
            let meta = VideoMeta {
                frames_sampled: video.frames_sampled,
                fps: video.fps,
                fps_estimated: video.fps_estimated,
                approx_total_frames: video.approx_total_frames,
            };
            (metrics, None, Some(meta))
        }
    };

    Ok(ResultPayload {
        kind,
        file_path,
        elapsed_ms: start.elapsed().as_millis() as u64,
        defect_detected,
        metrics,
        image_base64,
        meta,
    })
}

/// Encode an RGB buffer as a base64 JPEG.
pub fn encode_jpeg_base64(image: &RgbImage) -> Result<String, AnalysisError> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, PREVIEW_JPEG_QUALITY)
        .encode_image(image)
        .map_err(|e| AnalysisError::Encode(e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}
