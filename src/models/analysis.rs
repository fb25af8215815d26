use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

/// Raw visual statistics of one decoded frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetrics {
    /// Variance of the Laplacian response (≥ 0). Low means blurred.
    pub sharpness: f64,
    /// Fraction of Canny edge pixels, in [0, 1].
    pub edge_density: f64,
    /// Fraction of red-dominant pixels, in [0, 1].
    pub color_anomaly_ratio: f64,
}

/// Media family selected from a file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

/// Outcome of analyzing one still image.
#[derive(Debug, Clone)]
pub struct ImageReport {
    pub metrics: FrameMetrics,
    pub blurry: bool,
    /// Weighted defect score, clamped to [0, 1].
    pub defect_score: f64,
    pub defect_detected: bool,
    /// Annotated copy of the source, same dimensions.
    pub annotated: RgbImage,
}

/// Outcome of sampling and analyzing a video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoReport {
    /// Per-metric means over the sampled frames (zero when nothing was sampled).
    pub mean_metrics: FrameMetrics,
    pub frames_sampled: u32,
    /// Best-effort count from container metadata; 0 when unknown.
    pub approx_total_frames: u64,
    pub fps: f64,
    /// True when the container did not report a frame rate and `fps` is the fallback.
    pub fps_estimated: bool,
    /// Defective sampled frames over sampled frames, in [0, 1].
    pub defect_ratio: f64,
    pub defect_detected: bool,
}

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub enum AnalysisReport {
    Image(ImageReport),
    Video(VideoReport),
}

impl AnalysisReport {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Image(_) => MediaKind::Image,
            Self::Video(_) => MediaKind::Video,
        }
    }

    pub fn defect_detected(&self) -> bool {
        match self {
            Self::Image(r) => r.defect_detected,
            Self::Video(r) => r.defect_detected,
        }
    }
}

/// Frame-count metadata attached to video results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMeta {
    pub frames_sampled: u32,
    pub fps: f64,
    pub fps_estimated: bool,
    pub approx_total_frames: u64,
}

/// Serialized SUCCESS payload stored in the job registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub file_path: String,
    pub elapsed_ms: u64,
    pub defect_detected: bool,
    pub metrics: BTreeMap<String, f64>,
    /// Base64 JPEG of the annotated image (images only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<VideoMeta>,
}
