use anyhow::Result;

use crate::detect::analyzer::FrameAnalyzer;
use crate::detect::result::{MotionAnalysis, Region};
use crate::frame::Frame;

const DEFAULT_PIXEL_THRESHOLD: u8 = 30;
const DEFAULT_MIN_CHANGED_FRACTION: f32 = 0.02;
const BLUR_RADIUS: i64 = 2;
const OUTLINE_RGB: [u8; 3] = [0, 255, 0];

/// Grayscale frame differencing.
///
/// Frames are reduced to blurred luma; a pixel counts as changed when its luma
/// differs from the reference by more than `pixel_threshold`. Motion is present
/// when the changed share of the frame reaches `min_changed_fraction`.
#[derive(Clone, Copy, Debug)]
pub struct DifferenceAnalyzer {
    pub pixel_threshold: u8,
    pub min_changed_fraction: f32,
}

impl Default for DifferenceAnalyzer {
    fn default() -> Self {
        Self {
            pixel_threshold: DEFAULT_PIXEL_THRESHOLD,
            min_changed_fraction: DEFAULT_MIN_CHANGED_FRACTION,
        }
    }
}

impl DifferenceAnalyzer {
    fn blurred_luma(frame: &Frame) -> Vec<u8> {
        let (w, h) = (i64::from(frame.width()), i64::from(frame.height()));
        let luma = frame.luma();
        let mut out = vec![0u8; luma.len()];
        for y in 0..h {
            for x in 0..w {
                let mut sum = 0u32;
                let mut count = 0u32;
                for dy in -BLUR_RADIUS..=BLUR_RADIUS {
                    for dx in -BLUR_RADIUS..=BLUR_RADIUS {
                        let (nx, ny) = (x + dx, y + dy);
                        if nx >= 0 && ny >= 0 && nx < w && ny < h {
                            sum += u32::from(luma[(ny * w + nx) as usize]);
                            count += 1;
                        }
                    }
                }
                out[(y * w + x) as usize] = (sum / count.max(1)) as u8;
            }
        }
        out
    }

    fn gray_frame(width: u32, height: u32, luma: &[u8]) -> Frame {
        let mut frame = Frame::filled(width, height, [0, 0, 0]);
        for (px, &value) in frame.pixels_mut().chunks_exact_mut(3).zip(luma) {
            px.copy_from_slice(&[value; 3]);
        }
        frame
    }

    fn outline(frame: &Frame, region: Region) -> Frame {
        let mut annotated = frame.clone();
        let width = frame.width();
        let pixels = annotated.pixels_mut();
        let mut paint = |x: u32, y: u32| {
            let i = ((y * width + x) * 3) as usize;
            pixels[i..i + 3].copy_from_slice(&OUTLINE_RGB);
        };
        let (x1, y1) = (region.x, region.y);
        let (x2, y2) = (region.x + region.w - 1, region.y + region.h - 1);
        for x in x1..=x2 {
            paint(x, y1);
            paint(x, y2);
        }
        for y in y1..=y2 {
            paint(x1, y);
            paint(x2, y);
        }
        annotated
    }
}

impl FrameAnalyzer for DifferenceAnalyzer {
    fn name(&self) -> &'static str {
        "difference"
    }

    fn prepare(&self, frame: &Frame) -> Frame {
        Self::gray_frame(frame.width(), frame.height(), &Self::blurred_luma(frame))
    }

    fn detect_motion(&self, frame: &Frame, reference: &Frame) -> Result<MotionAnalysis> {
        let prepared = self.prepare(frame);
        if (frame.width(), frame.height()) != (reference.width(), reference.height()) {
            // Resolution change: the old reference is meaningless.
            return Ok(MotionAnalysis {
                motion_present: true,
                region: None,
                annotated: None,
                reference: prepared,
            });
        }

        let width = frame.width();
        let mut changed = 0u64;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
        let current = prepared.pixels().chunks_exact(3);
        let previous = reference.pixels().chunks_exact(3);
        for (i, (cur, prev)) in current.zip(previous).enumerate() {
            if cur[0].abs_diff(prev[0]) > self.pixel_threshold {
                changed += 1;
                let (x, y) = (i as u32 % width, i as u32 / width);
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }

        let total = u64::from(frame.width()) * u64::from(frame.height());
        let fraction = if total == 0 {
            0.0
        } else {
            changed as f32 / total as f32
        };
        let motion_present = changed > 0 && fraction >= self.min_changed_fraction;
        let region = (changed > 0).then(|| Region {
            x: min_x,
            y: min_y,
            w: max_x - min_x + 1,
            h: max_y - min_y + 1,
        });
        let annotated = match (motion_present, region) {
            (true, Some(region)) => Some(Self::outline(frame, region)),
            _ => None,
        };

        Ok(MotionAnalysis {
            motion_present,
            region,
            annotated,
            reference: prepared,
        })
    }
}
