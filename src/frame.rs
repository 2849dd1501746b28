//! Frames and presentation overlays.
//!
//! - `Frame`: one RGB8 image from the camera (or the offline placeholder).
//! - `annotate`: draws tracked boxes and the crossing line in place.
//! - `encode_jpeg`: what the live feed actually ships.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::{EpochMillis, TrackedObject};

const BYTES_PER_PIXEL: usize = 3;

type Rgb = [u8; 3];

const LINE_COLOR: Rgb = [255, 210, 0];
const BOX_COLOR: Rgb = [0, 220, 80];
const PLACEHOLDER_BACKGROUND: Rgb = [32, 32, 32];
const PLACEHOLDER_MARK: Rgb = [200, 40, 40];

pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic per-device sequence number; placeholders use 0.
    pub seq: u64,
    pub captured_at: EpochMillis,
}

impl Frame {
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        seq: u64,
        captured_at: EpochMillis,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} RGB",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            seq,
            captured_at,
        })
    }

    /// Static "camera offline" frame: dark background with a red cross.
    pub fn placeholder(width: u32, height: u32) -> Self {
        let mut frame = Self {
            pixels: vec![0u8; width as usize * height as usize * BYTES_PER_PIXEL],
            width,
            height,
            seq: 0,
            captured_at: 0,
        };
        frame.fill(PLACEHOLDER_BACKGROUND);
        let (w, h) = (width as i64, height as i64);
        let steps = w.max(h);
        for i in 0..steps {
            let x = i * w / steps.max(1);
            let y = i * h / steps.max(1);
            for t in -1..=1 {
                frame.put(x + t, y, PLACEHOLDER_MARK);
                frame.put(w - 1 - x + t, y, PLACEHOLDER_MARK);
            }
        }
        frame
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        Some([self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]])
    }

    /// Overlay the crossing line and one rectangle per tracked object.
    ///
    /// Boxes with non-finite coordinates are skipped.
    pub fn annotate(&mut self, objects: &[TrackedObject], line_y: f32) {
        if line_y.is_finite() {
            let y = to_pixel(line_y, self.height);
            for thickness in 0..2 {
                self.hline(0, self.width as i64 - 1, y + thickness, LINE_COLOR);
            }
        }
        for object in objects {
            let b = object.bbox;
            if ![b.x1, b.y1, b.x2, b.y2].iter().all(|v| v.is_finite()) {
                continue;
            }
            let (x1, y1) = (to_pixel(b.x1, self.width), to_pixel(b.y1, self.height));
            let (x2, y2) = (to_pixel(b.x2, self.width), to_pixel(b.y2, self.height));
            for t in 0..2 {
                self.hline(x1, x2, y1 + t, BOX_COLOR);
                self.hline(x1, x2, y2 - t, BOX_COLOR);
                self.vline(x1 + t, y1, y2, BOX_COLOR);
                self.vline(x2 - t, y1, y2, BOX_COLOR);
            }
        }
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.pixels.len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&self.pixels, self.width, self.height, ExtendedColorType::Rgb8)
            .map_err(|e| anyhow!("jpeg encode failed: {}", e))?;
        Ok(out)
    }

    fn fill(&mut self, color: Rgb) {
        for px in self.pixels.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.copy_from_slice(&color);
        }
    }

    fn put(&mut self, x: i64, y: i64, color: Rgb) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        self.pixels[idx..idx + BYTES_PER_PIXEL].copy_from_slice(&color);
    }

    fn hline(&mut self, x1: i64, x2: i64, y: i64, color: Rgb) {
        let (lo, hi) = (x1.min(x2).max(0), x1.max(x2).min(self.width as i64 - 1));
        for x in lo..=hi {
            self.put(x, y, color);
        }
    }

    fn vline(&mut self, x: i64, y1: i64, y2: i64, color: Rgb) {
        let (lo, hi) = (y1.min(y2).max(0), y1.max(y2).min(self.height as i64 - 1));
        for y in lo..=hi {
            self.put(x, y, color);
        }
    }
}

/// Round to a pixel index, clamped just outside `[0, limit)` so edge
/// strokes stay off-canvas and offsets cannot overflow.
fn to_pixel(value: f32, limit: u32) -> i64 {
    (value.round() as i64).clamp(-2, limit as i64 + 2)
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("seq", &self.seq)
            .field("captured_at", &self.captured_at)
            .finish_non_exhaustive()
    }
}
