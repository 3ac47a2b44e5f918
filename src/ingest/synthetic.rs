//! Synthetic frame source (`stub://`).
//!
//! Produces a static gradient background. Every `change_every` frames a bright
//! block moves to a new position and stays there, which reads as one burst of
//! motion followed by a new steady state.

use anyhow::Result;

use super::{FrameRead, SourceStats, VideoSource};
use crate::frame::Frame;
use crate::log::Logger;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Frames between scene changes. Zero disables changes.
    pub change_every: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            width: 320,
            height: 240,
            change_every: 50,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    open: bool,
    frame_count: u64,
    /// Simulated scene state, bumped on every scene change.
    scene_state: u32,
    stats: SourceStats,
    log: Logger,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig, log: Logger) -> Self {
        Self {
            config,
            open: false,
            frame_count: 0,
            scene_state: 0,
            stats: SourceStats::default(),
            log,
        }
    }

    fn render(&self) -> Frame {
        let (width, height) = (self.config.width, self.config.height);
        let mut frame = Frame::filled(width, height, [0, 0, 0]);
        let pixels = frame.pixels_mut();
        for y in 0..height {
            for x in 0..width {
                let i = ((y * width + x) * 3) as usize;
                let shade = ((x + y) % 64) as u8;
                pixels[i] = shade;
                pixels[i + 1] = shade;
                pixels[i + 2] = shade;
            }
        }

        // Bright block, a quarter of each dimension, placed by scene state.
        let block_w = (width / 4).max(1);
        let block_h = (height / 4).max(1);
        let slots_x = (width / block_w).max(1);
        let origin_x = (self.scene_state % slots_x) * block_w;
        let origin_y = ((self.scene_state / slots_x) % (height / block_h).max(1)) * block_h;
        for y in origin_y..(origin_y + block_h).min(height) {
            for x in origin_x..(origin_x + block_w).min(width) {
                let i = ((y * width + x) * 3) as usize;
                pixels[i..i + 3].copy_from_slice(&[250, 250, 250]);
            }
        }
        frame
    }
}

impl VideoSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.url
    }

    /// Synthetic sources are always available.
    fn open(&mut self) -> Result<()> {
        if !self.open {
            self.open = true;
            self.stats.opens += 1;
            log::info!(target: self.log.target(), "opened {} (synthetic)", self.config.url);
        }
        Ok(())
    }

    fn read(&mut self) -> Result<FrameRead> {
        if !self.open {
            self.stats.not_ready += 1;
            return Ok(FrameRead::NotReady);
        }
        self.frame_count += 1;
        if self.config.change_every > 0 && self.frame_count.is_multiple_of(self.config.change_every) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        self.stats.frames_read += 1;
        Ok(FrameRead::Frame(self.render()))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            log::info!(target: self.log.target(), "closed {}", self.config.url);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}
