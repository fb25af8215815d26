use garde::Validate;
use image::RgbImage;
use serde::Deserialize;
use std::collections::VecDeque;

use crate::models::analysis::{FrameMetrics, VideoReport};
use crate::services::error::AnalysisError;
use crate::services::frame_metrics;

/// Sharpness below this marks a sampled frame as blurry (stricter than stills).
pub const FRAME_BLUR_THRESHOLD: f64 = 80.0;
pub const FRAME_RED_RATIO_THRESHOLD: f64 = 0.12;
pub const FRAME_SCORE_THRESHOLD: f64 = 0.45;
/// A video is defective when more than this share of sampled frames are.
pub const DEFECT_RATIO_THRESHOLD: f64 = 0.2;
/// Frame rate reported when the container does not carry one.
pub const FALLBACK_FPS: f64 = 30.0;

/// Sampling bounds for one video.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Validate)]
pub struct VideoOptions {
    /// Decode every Nth frame.
    #[garde(range(min = 1))]
    pub frame_stride: u32,

    /// Stop after this many sampled frames.
    #[garde(range(min = 1))]
    pub max_frames: u32,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            frame_stride: 15,
            max_frames: 300,
        }
    }
}

/// Best-effort container metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamInfo {
    pub fps: Option<f64>,
    pub total_frames: Option<u64>,
}

/// A sequential stream of frames.
///
/// `grab` advances past the next frame without materializing it; `retrieve`
/// returns the frame most recently grabbed.
pub trait FrameSource {
    fn info(&self) -> StreamInfo;

    /// Advance one frame. `Ok(false)` once the stream is exhausted.
    fn grab(&mut self) -> Result<bool, AnalysisError>;

    /// Decode the last grabbed frame. `Ok(None)` if it cannot be produced.
    fn retrieve(&mut self) -> Result<Option<RgbImage>, AnalysisError>;
}

/// Frames held in memory, for tests and pre-decoded clips.
#[derive(Debug, Default)]
pub struct MemoryFrameSource {
    pending: VecDeque<RgbImage>,
    current: Option<RgbImage>,
    info: StreamInfo,
}

impl MemoryFrameSource {
    pub fn new(frames: Vec<RgbImage>, info: StreamInfo) -> Self {
        Self {
            pending: frames.into(),
            current: None,
            info,
        }
    }
}

impl FrameSource for MemoryFrameSource {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn grab(&mut self) -> Result<bool, AnalysisError> {
        self.current = self.pending.pop_front();
        Ok(self.current.is_some())
    }

    fn retrieve(&mut self) -> Result<Option<RgbImage>, AnalysisError> {
        Ok(self.current.take())
    }
}

/// Per-frame defect rule for video samples.
///
/// The weighted sum is intentionally left unclamped, and the blur threshold
/// is stricter than the still-image path.
pub fn frame_is_defective(metrics: &FrameMetrics) -> bool {
    let blurry = metrics.sharpness < FRAME_BLUR_THRESHOLD;
    let score = (if blurry { 0.6 } else { 0.0 })
        + 0.3 * metrics.edge_density
        + 0.4 * metrics.color_anomaly_ratio;
    blurry || metrics.color_anomaly_ratio > FRAME_RED_RATIO_THRESHOLD || score >= FRAME_SCORE_THRESHOLD
}

/// Sample `source` at `options.frame_stride` and aggregate frame metrics.
pub fn analyze_video(
    source: &mut dyn FrameSource,
    options: &VideoOptions,
) -> Result<VideoReport, AnalysisError> {
    let stride = options.frame_stride.max(1) as u64;
    let info = source.info();

    let mut sampled = 0u32;
    let mut defective = 0u32;
    let mut totals = FrameMetrics::default();
    let mut index = 0u64;

    while source.grab()? {
        if index % stride == 0 {
            let Some(frame) = source.retrieve()? else {
                break;
            };
            let metrics = frame_metrics::extract(&frame);
            if frame_is_defective(&metrics) {
                defective += 1;
            }
            totals.sharpness += metrics.sharpness;
            totals.edge_density += metrics.edge_density;
            totals.color_anomaly_ratio += metrics.color_anomaly_ratio;
            sampled += 1;

            if sampled >= options.max_frames {
                break;
            }
        }
        index += 1;
    }

    let (mean_metrics, defect_ratio) = if sampled == 0 {
        (FrameMetrics::default(), 0.0)
    } else {
        let n = sampled as f64;
        (
            FrameMetrics {
                sharpness: totals.sharpness / n,
                edge_density: totals.edge_density / n,
                color_anomaly_ratio: totals.color_anomaly_ratio / n,
            },
            (defective as f64 / n).clamp(0.0, 1.0),
        )
    };

    let measured_fps = info.fps.filter(|fps| fps.is_finite() && *fps > 0.0);

    Ok(VideoReport {
        mean_metrics,
        frames_sampled: sampled,
        // Container counts can undershoot; never report fewer than were sampled.
        approx_total_frames: info
            .total_frames
            .map_or(0, |total| total.max(sampled as u64)),
        fps: measured_fps.unwrap_or(FALLBACK_FPS),
        fps_estimated: measured_fps.is_none(),
        defect_ratio,
        defect_detected: defect_ratio > DEFECT_RATIO_THRESHOLD,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sharp_frame() -> RgbImage {
        RgbImage::from_fn(16, 16, |x, y| {
            let v = if (x + y) % 2 == 0 { 100 } else { 104 };
            Rgb([v, v, v])
        })
    }

    fn red_frame() -> RgbImage {
        RgbImage::from_pixel(16, 16, Rgb([220, 20, 20]))
    }

    fn source(frames: Vec<RgbImage>) -> MemoryFrameSource {
        let total = frames.len() as u64;
        MemoryFrameSource::new(
            frames,
            StreamInfo {
                fps: Some(25.0),
                total_frames: Some(total),
            },
        )
    }

    #[test]
    fn test_stride_sampling_over_long_stream() {
        let mut src = source(vec![sharp_frame(); 450]);
        let report = analyze_video(&mut src, &VideoOptions::default()).unwrap();
        assert_eq!(report.frames_sampled, 30);
        assert_eq!(report.approx_total_frames, 450);
        assert!(report.frames_sampled as u64 <= report.approx_total_frames);
        assert_eq!(report.defect_ratio, 0.0);
        assert!(!report.defect_detected);
        assert!((report.mean_metrics.sharpness - 256.0).abs() < 1e-9);
    }

    #[test]
    fn test_max_frames_bounds_sampling() {
        let mut src = source(vec![sharp_frame(); 100]);
        let options = VideoOptions {
            frame_stride: 2,
            max_frames: 7,
        };
        let report = analyze_video(&mut src, &options).unwrap();
        assert_eq!(report.frames_sampled, 7);
    }

    #[test]
    fn test_stream_shorter_than_stride_samples_first_frame() {
        let mut src = source(vec![red_frame(); 10]);
        let report = analyze_video(&mut src, &VideoOptions::default()).unwrap();
        assert_eq!(report.frames_sampled, 1);
        assert_eq!(report.defect_ratio, 1.0);
        assert!(report.defect_detected);
    }

    #[test]
    fn test_undercounted_container_total() {
        let mut src = MemoryFrameSource::new(
            vec![sharp_frame(); 60],
            StreamInfo {
                fps: None,
                total_frames: Some(2),
            },
        );
        let report = analyze_video(&mut src, &VideoOptions::default()).unwrap();
        assert_eq!(report.frames_sampled, 4);
        assert_eq!(report.approx_total_frames, 4);
    }

    #[test]
    fn test_empty_stream() {
        let mut src = MemoryFrameSource::new(Vec::new(), StreamInfo::default());
        let report = analyze_video(&mut src, &VideoOptions::default()).unwrap();
        assert_eq!(report.frames_sampled, 0);
        assert_eq!(report.defect_ratio, 0.0);
        assert_eq!(report.mean_metrics, FrameMetrics::default());
        assert!(!report.defect_detected);
        assert_eq!(report.fps, FALLBACK_FPS);
        assert!(report.fps_estimated);
    }

    #[test]
    fn test_defect_ratio_counts_sampled_frames_only() {
        // Frames 0, 15 and 30 are red; every other frame is clean.
        let frames: Vec<_> = (0..150)
            .map(|i| if i % 15 == 0 && i <= 30 { red_frame() } else { sharp_frame() })
            .collect();
        let mut src = source(frames);
        let report = analyze_video(&mut src, &VideoOptions::default()).unwrap();
        assert_eq!(report.frames_sampled, 10);
        assert!((report.defect_ratio - 0.3).abs() < 1e-12);
        assert!(report.defect_detected);
        assert!((report.mean_metrics.color_anomaly_ratio - 0.3).abs() < 1e-12);
        assert_eq!(report.fps, 25.0);
        assert!(!report.fps_estimated);
    }

    #[test]
    fn test_frame_rule_uses_unclamped_sum() {
        // 0.3·1.0 + 0.4·0.12 = 0.348: not enough on its own.
        let metrics = FrameMetrics {
            sharpness: 1000.0,
            edge_density: 1.0,
            color_anomaly_ratio: 0.12,
        };
        assert!(!frame_is_defective(&metrics));

        let blurry = FrameMetrics {
            sharpness: 79.9,
            ..FrameMetrics::default()
        };
        assert!(frame_is_defective(&blurry));

        // A still image with this sharpness is not blurry.
        let between = FrameMetrics {
            sharpness: 60.0,
            ..FrameMetrics::default()
        };
        assert!(frame_is_defective(&between));
    }

    #[test]
    fn test_options_validation() {
        assert!(VideoOptions::default().validate().is_ok());
        let bad = VideoOptions {
            frame_stride: 0,
            max_frames: 300,
        };
        assert!(bad.validate().is_err());
    }
}
