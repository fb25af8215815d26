//! Overlay drawing for annotated previews.
//!
//! Text uses a tiny built-in 5x7 uppercase bitmap font, scaled up. Only the
//! glyphs our markers need are defined; anything else renders as a blank cell.

use image::{GrayImage, Rgb, RgbImage};

pub const MARKER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const EDGE_HIGHLIGHT: Rgb<u8> = Rgb([0, 0, 255]);

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const GLYPH_SPACING: u32 = 1;
const SCALE: u32 = 3;

fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        '!' => [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00000, 0b00100],
        _ => [0; 7],
    }
}

/// Draw `text` with its bottom-left corner at (`x`, `baseline`). Clipped to the image.
pub fn draw_text(image: &mut RgbImage, text: &str, x: u32, baseline: u32, color: Rgb<u8>) {
    let top = baseline as i64 - (GLYPH_HEIGHT * SCALE) as i64;
    let (w, h) = (image.width() as i64, image.height() as i64);

    for (n, c) in text.chars().enumerate() {
        let origin_x = x as i64 + (n as u32 * (GLYPH_WIDTH + GLYPH_SPACING) * SCALE) as i64;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                for sy in 0..SCALE {
                    for sx in 0..SCALE {
                        let px = origin_x + (col * SCALE + sx) as i64;
                        let py = top + (row as u32 * SCALE + sy) as i64;
                        if px >= 0 && py >= 0 && px < w && py < h {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
    }
}

/// Recolor every pixel set in `edges` (same dimensions as `image`).
pub fn highlight_edges(image: &mut RgbImage, edges: &GrayImage, color: Rgb<u8>) {
    for (x, y, p) in edges.enumerate_pixels() {
        if p.0[0] > 0 && x < image.width() && y < image.height() {
            image.put_pixel(x, y, color);
        }
    }
}
