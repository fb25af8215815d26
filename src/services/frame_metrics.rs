//! Raw visual statistics for a single decoded frame.
//!
//! All functions here are pure: they borrow the frame, allocate their own
//! scratch buffers and touch no shared state, so frames can be measured
//! concurrently without locking.

use image::{GrayImage, Luma, RgbImage};

use crate::models::analysis::FrameMetrics;

/// Canny hysteresis thresholds on the L1 Sobel gradient magnitude.
pub const CANNY_LOW_THRESHOLD: i32 = 100;
pub const CANNY_HIGH_THRESHOLD: i32 = 200;

/// Red-dominant color signature. A pixel matches when R > 150, G < 120, B < 120.
pub const RED_MIN: u8 = 150;
pub const GREEN_MAX: u8 = 120;
pub const BLUE_MAX: u8 = 120;

/// tan(22.5°) in Q15 fixed point, for gradient direction binning.
const TG22: i64 = 13573;

/// Compute all three metrics for one frame.
pub fn extract(frame: &RgbImage) -> FrameMetrics {
    let gray = to_gray(frame);
    let edges = canny_edges(&gray);
    FrameMetrics {
        sharpness: laplacian_variance(&gray),
        edge_density: edge_fraction(&edges),
        color_anomaly_ratio: color_anomaly_ratio(frame),
    }
}

/// ITU-R BT.601 luminance in 14-bit fixed point with rounding.
pub fn to_gray(frame: &RgbImage) -> GrayImage {
    let (w, h) = frame.dimensions();
    let mut gray = GrayImage::new(w, h);
    for (x, y, p) in frame.enumerate_pixels() {
        let [r, g, b] = p.0;
        let luma = (r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + (1 << 13)) >> 14;
        gray.put_pixel(x, y, Luma([luma as u8]));
    }
    gray
}

/// Variance of the 3x3 Laplacian response `[0,1,0; 1,-4,1; 0,1,0]`.
///
/// Borders are handled by reflect-101 so every pixel contributes.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = (gray.width() as i64, gray.height() as i64);
    if w == 0 || h == 0 {
        return 0.0;
    }
    let at = |x: i64, y: i64| gray.get_pixel(reflect101(x, w), reflect101(y, h)).0[0] as f64;

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h {
        for x in 0..w {
            let response =
                at(x, y - 1) + at(x, y + 1) + at(x - 1, y) + at(x + 1, y) - 4.0 * at(x, y);
            sum += response;
            sum_sq += response * response;
        }
    }

    let n = (w * h) as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Binary edge map from a Canny detector (3x3 Sobel, L1 magnitude,
/// non-maximum suppression, 8-connected hysteresis). Edge pixels are 255.
pub fn canny_edges(gray: &GrayImage) -> GrayImage {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let mut edges = GrayImage::new(w as u32, h as u32);
    if w == 0 || h == 0 {
        return edges;
    }

    // Sobel reads past the border by replicating the outermost pixel.
    let (wi, hi) = (w as i64, h as i64);
    let at = |x: i64, y: i64| {
        gray.get_pixel(x.clamp(0, wi - 1) as u32, y.clamp(0, hi - 1) as u32).0[0] as i32
    };

    let mut dx = vec![0i32; w * h];
    let mut dy = vec![0i32; w * h];
    let mut mag = vec![0i32; w * h];
    for y in 0..hi {
        for x in 0..wi {
            let gx = (at(x + 1, y - 1) + 2 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2 * at(x - 1, y) + at(x - 1, y + 1));
            let gy = (at(x - 1, y + 1) + 2 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2 * at(x, y - 1) + at(x + 1, y - 1));
            let i = y as usize * w + x as usize;
            dx[i] = gx;
            dy[i] = gy;
            mag[i] = gx.abs() + gy.abs();
        }
    }

    // Magnitudes outside the image count as zero.
    let mag_at = |x: i64, y: i64| -> i32 {
        if x < 0 || y < 0 || x >= wi || y >= hi {
            0
        } else {
            mag[y as usize * w + x as usize]
        }
    };

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        None,
        Weak,
        Strong,
    }
    let mut marks = vec![Mark::None; w * h];
    let mut stack = Vec::new();

    for y in 0..hi {
        for x in 0..wi {
            let i = y as usize * w + x as usize;
            let m = mag[i];
            if m <= CANNY_LOW_THRESHOLD {
                continue;
            }

            let ax = dx[i].abs() as i64;
            let ay = (dy[i].abs() as i64) << 15;
            let tg22x = ax * TG22;
            let is_max = if ay < tg22x {
                m > mag_at(x - 1, y) && m >= mag_at(x + 1, y)
            } else {
                let tg67x = tg22x + (ax << 16);
                if ay > tg67x {
                    m > mag_at(x, y - 1) && m >= mag_at(x, y + 1)
                } else {
                    let s = if (dx[i] ^ dy[i]) < 0 { -1 } else { 1 };
                    m > mag_at(x - s, y - 1) && m > mag_at(x + s, y + 1)
                }
            };
            if !is_max {
                continue;
            }

            if m > CANNY_HIGH_THRESHOLD {
                marks[i] = Mark::Strong;
                stack.push((x, y));
            } else {
                marks[i] = Mark::Weak;
            }
        }
    }

    while let Some((x, y)) = stack.pop() {
        for ny in (y - 1)..=(y + 1) {
            for nx in (x - 1)..=(x + 1) {
                if nx < 0 || ny < 0 || nx >= wi || ny >= hi {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if marks[j] == Mark::Weak {
                    marks[j] = Mark::Strong;
                    stack.push((nx, ny));
                }
            }
        }
    }

    for (i, mark) in marks.iter().enumerate() {
        if *mark == Mark::Strong {
            edges.put_pixel((i % w) as u32, (i / w) as u32, Luma([255]));
        }
    }
    edges
}

/// Fraction of pixels marked in an edge map.
pub fn edge_fraction(edges: &GrayImage) -> f64 {
    let total = edges.width() as u64 * edges.height() as u64;
    if total == 0 {
        return 0.0;
    }
    let marked = edges.pixels().filter(|p| p.0[0] > 0).count() as u64;
    marked as f64 / total as f64
}

/// Fraction of pixels matching the red-dominant signature.
pub fn color_anomaly_ratio(frame: &RgbImage) -> f64 {
    let total = frame.width() as u64 * frame.height() as u64;
    if total == 0 {
        return 0.0;
    }
    let matched = frame
        .pixels()
        .filter(|p| {
            let [r, g, b] = p.0;
            r > RED_MIN && g < GREEN_MAX && b < BLUE_MAX
        })
        .count() as u64;
    matched as f64 / total as f64
}

/// Reflect-101 border index (`gfedcb|abcdefgh|gfedcba`).
fn reflect101(i: i64, n: i64) -> u32 {
    if n == 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * n - 2 - i;
        }
    }
    i as u32
}
