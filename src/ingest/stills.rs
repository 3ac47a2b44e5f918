//! Local still-image source.
//!
//! Replays the JPEG/PNG files of a local directory in name order, looping
//! forever. Files are decoded in memory on each read; nothing is written.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

use super::{FrameRead, SourceStats, VideoSource};
use crate::frame::Frame;
use crate::log::Logger;

const STILL_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct StillsSource {
    dir: PathBuf,
    name: String,
    files: Vec<PathBuf>,
    cursor: usize,
    open: bool,
    stats: SourceStats,
    log: Logger,
}

impl StillsSource {
    pub fn new(dir: impl AsRef<Path>, log: Logger) -> Result<Self> {
        let dir = dir.as_ref();
        let name = dir.display().to_string();
        if name.contains("://") {
            return Err(anyhow!(
                "still-image source only supports local directories (got '{}')",
                name
            ));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            name,
            files: Vec::new(),
            cursor: 0,
            open: false,
            stats: SourceStats::default(),
            log,
        })
    }

    fn list_stills(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| anyhow!("failed to list {}: {}", self.dir.display(), e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| STILL_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

impl VideoSource for StillsSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }
        let files = self.list_stills()?;
        if files.is_empty() {
            return Err(anyhow!("no still images found in {}", self.dir.display()));
        }
        log::info!(
            target: self.log.target(),
            "opened {} ({} still(s))",
            self.name,
            files.len()
        );
        self.files = files;
        self.cursor = 0;
        self.open = true;
        self.stats.opens += 1;
        Ok(())
    }

    fn read(&mut self) -> Result<FrameRead> {
        if !self.open || self.files.is_empty() {
            self.stats.not_ready += 1;
            return Ok(FrameRead::NotReady);
        }
        let path = &self.files[self.cursor];
        self.cursor = (self.cursor + 1) % self.files.len();
        let rgb = image::open(path)
            .map_err(|e| anyhow!("failed to decode {}: {}", path.display(), e))?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        let frame = Frame::new(width, height, rgb.into_raw())?;
        self.stats.frames_read += 1;
        Ok(FrameRead::Frame(frame))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.files.clear();
            log::info!(target: self.log.target(), "closed {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}
