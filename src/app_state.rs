use std::sync::Arc;

use crate::services::{queue::JobQueue, registry::JobRegistry, staging::UploadStaging};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn JobRegistry>,
    pub queue: Arc<dyn JobQueue>,
    pub staging: Arc<UploadStaging>,
    /// Per-file upload limit in bytes.
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        queue: Arc<dyn JobQueue>,
        staging: UploadStaging,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            registry,
            queue,
            staging: Arc::new(staging),
            max_upload_bytes,
        }
    }
}
