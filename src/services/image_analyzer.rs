use image::{ImageReader, RgbImage};
use std::path::Path;

use crate::models::analysis::{FrameMetrics, ImageReport};
use crate::services::annotate::{self, EDGE_HIGHLIGHT, MARKER_COLOR};
use crate::services::error::AnalysisError;
use crate::services::frame_metrics;

/// Sharpness below this marks a still image as blurry.
pub const BLUR_THRESHOLD: f64 = 50.0;
/// Color-anomaly ratio above this flags a defect on its own.
pub const RED_RATIO_THRESHOLD: f64 = 0.12;
/// Edge density above this flags a defect and triggers edge highlighting.
pub const EDGE_DENSITY_THRESHOLD: f64 = 0.15;
/// Score at or above this flags a defect.
pub const SCORE_THRESHOLD: f64 = 0.45;

/// Decode an image file into an 8-bit RGB buffer.
pub fn load_image(path: &Path) -> Result<RgbImage, AnalysisError> {
    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| AnalysisError::Decode(e.to_string()))?;
    let decoded = reader
        .decode()
        .map_err(|e| AnalysisError::Decode(e.to_string()))?;
    Ok(decoded.into_rgb8())
}

/// Decode and analyze an image file.
pub fn analyze_path(path: &Path) -> Result<ImageReport, AnalysisError> {
    let frame = load_image(path)?;
    if frame.width() == 0 || frame.height() == 0 {
        return Err(AnalysisError::Decode("image has no pixels".to_string()));
    }
    Ok(analyze_image(&frame))
}

/// Score one decoded image and produce its annotated copy.
///
/// Metrics are computed on `frame` before any drawing happens; `frame` itself
/// is never modified.
pub fn analyze_image(frame: &RgbImage) -> ImageReport {
    let gray = frame_metrics::to_gray(frame);
    let edges = frame_metrics::canny_edges(&gray);
    let metrics = FrameMetrics {
        sharpness: frame_metrics::laplacian_variance(&gray),
        edge_density: frame_metrics::edge_fraction(&edges),
        color_anomaly_ratio: frame_metrics::color_anomaly_ratio(frame),
    };

    let blurry = metrics.sharpness < BLUR_THRESHOLD;
    let defect_score = defect_score(&metrics, blurry);
    let red_anomaly = metrics.color_anomaly_ratio > RED_RATIO_THRESHOLD;
    let edge_heavy = metrics.edge_density > EDGE_DENSITY_THRESHOLD;
    let defect_detected = blurry || red_anomaly || edge_heavy || defect_score >= SCORE_THRESHOLD;

    let mut annotated = frame.clone();
    if blurry {
        annotate::draw_text(&mut annotated, "Blurry!", 10, 30, MARKER_COLOR);
    }
    if red_anomaly {
        annotate::draw_text(&mut annotated, "Red anomaly!", 10, 70, MARKER_COLOR);
    }
    if edge_heavy {
        annotate::highlight_edges(&mut annotated, &edges, EDGE_HIGHLIGHT);
    }

    ImageReport {
        metrics,
        blurry,
        defect_score,
        defect_detected,
        annotated,
    }
}

/// `0.6·[blurry] + min(edge/0.33, 0.3) + min(red/0.3, 0.4)`, clamped to [0, 1].
pub fn defect_score(metrics: &FrameMetrics, blurry: bool) -> f64 {
    let blur_term = if blurry { 0.6 } else { 0.0 };
    let edge_term = (metrics.edge_density / 0.33).clamp(0.0, 0.3);
    let red_term = (metrics.color_anomaly_ratio / 0.3).clamp(0.0, 0.4);
    (blur_term + edge_term + red_term).clamp(0.0, 1.0)
}
