use std::path::Path;

use crate::models::analysis::{AnalysisReport, MediaKind};
use crate::services::error::AnalysisError;
use crate::services::ffmpeg::FfmpegFrameSource;
use crate::services::image_analyzer;
use crate::services::video_analyzer::{self, FrameSource, VideoOptions};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp", "tiff"];
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm"];

/// Opens a video file as a frame stream.
pub trait VideoOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, AnalysisError>;
}

/// Decodes through the system `ffmpeg`/`ffprobe` binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegOpener;

impl VideoOpener for FfmpegOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, AnalysisError> {
        Ok(Box::new(FfmpegFrameSource::open(path)?))
    }
}

/// Classify a path by extension alone (case-insensitive).
pub fn classify(path: &Path) -> Result<MediaKind, AnalysisError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        Ok(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        Ok(MediaKind::Video)
    } else {
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        Err(AnalysisError::UnsupportedType { extension })
    }
}

/// Routes a file to the image or video analyzer.
pub struct AnalysisDispatcher {
    video_options: VideoOptions,
    opener: Box<dyn VideoOpener>,
}

impl AnalysisDispatcher {
    pub fn new(video_options: VideoOptions) -> Self {
        Self::with_opener(video_options, Box::new(FfmpegOpener))
    }

    pub fn with_opener(video_options: VideoOptions, opener: Box<dyn VideoOpener>) -> Self {
        Self {
            video_options,
            opener,
        }
    }

    /// Analyze one file. Blocking: decodes and scans pixels on the calling thread.
    pub fn dispatch(&self, path: &Path) -> Result<AnalysisReport, AnalysisError> {
        match classify(path)? {
            MediaKind::Image => image_analyzer::analyze_path(path).map(AnalysisReport::Image),
            MediaKind::Video => {
                let mut source = self.opener.open(path)?;
                video_analyzer::analyze_video(source.as_mut(), &self.video_options)
                    .map(AnalysisReport::Video)
            }
        }
    }
}

impl Default for AnalysisDispatcher {
    fn default() -> Self {
        Self::new(VideoOptions::default())
    }
}
