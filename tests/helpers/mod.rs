//! Shared builders for pipeline and HTTP tests.
#![allow(dead_code)]

use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use defect_scan::models::job::AnalysisJob;
use defect_scan::services::{
    dispatcher::AnalysisDispatcher,
    queue::{InMemoryJobQueue, JobQueue, QueuedJob},
    registry::{InMemoryJobRegistry, JobRegistry},
    video_analyzer::VideoOptions,
    worker::Worker,
};
use uuid::Uuid;

pub const TEST_DEQUEUE_WAIT: Duration = Duration::from_millis(50);

/// Sharp texture with no Canny edges and no red pixels.
pub fn clean_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let v = if (x + y) % 2 == 0 { 100 } else { 104 };
        Rgb([v, v, v])
    })
}

/// Flat red frame: blurry and fully anomalous.
pub fn red_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([220, 20, 20]))
}

pub fn write_png(dir: &Path, name: &str, image: &RgbImage) -> PathBuf {
    let path = dir.join(name);
    image.save(&path).expect("Failed to write test image");
    path
}

pub fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut bytes = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .expect("Failed to encode test image");
    bytes.into_inner()
}

/// In-memory queue, registry and a worker bound to both.
pub struct Pipeline {
    pub queue: Arc<InMemoryJobQueue>,
    pub registry: Arc<InMemoryJobRegistry>,
    pub worker: Worker,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_dispatcher(AnalysisDispatcher::new(VideoOptions::default()))
    }

    pub fn with_dispatcher(dispatcher: AnalysisDispatcher) -> Self {
        let queue = Arc::new(InMemoryJobQueue::new());
        let registry = Arc::new(InMemoryJobRegistry::default());
        let worker = Worker::new(
            queue.clone(),
            registry.clone(),
            Arc::new(dispatcher),
            TEST_DEQUEUE_WAIT,
        );
        Self {
            queue,
            registry,
            worker,
        }
    }

    /// Register and enqueue a job for `path`, as the upload route does.
    pub async fn submit(&self, path: &Path) -> QueuedJob {
        let job_id = Uuid::new_v4();
        let file_path = path.to_string_lossy().into_owned();
        self.registry
            .create(job_id, &file_path)
            .await
            .expect("Failed to register job");
        let job = QueuedJob::new(job_id, file_path);
        self.queue.enqueue(&job).await.expect("Failed to enqueue job");
        job
    }

    pub async fn job(&self, job_id: Uuid) -> AnalysisJob {
        self.registry
            .get(job_id)
            .await
            .expect("Registry lookup failed")
            .expect("Job not found")
    }
}
