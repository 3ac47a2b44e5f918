//! Frames, encoding and frame observers.
//!
//! - `Frame`: RGB8 pixel buffer as produced by a `VideoSource`.
//! - `FrameEncoder`: turns a frame into bytes (JPEG by default) for observers
//!   and event payloads.
//! - `FrameObservers`: registry of live-preview consumers. Each frame is
//!   published at most once, best effort.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;
use std::sync::{Arc, Mutex, RwLock};

use crate::log::Logger;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;
const RGB_CHANNELS: usize = 3;

/// Raw RGB8 frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * RGB_CHANNELS;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Uniformly filled frame.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * RGB_CHANNELS);
        for _ in 0..count {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Luma per pixel (BT.601 integer approximation).
    pub fn luma(&self) -> Vec<u8> {
        self.pixels
            .chunks_exact(RGB_CHANNELS)
            .map(|px| {
                let y = 299 * u32::from(px[0]) + 587 * u32::from(px[1]) + 114 * u32::from(px[2]);
                (y / 1000) as u8
            })
            .collect()
    }
}

pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>>;

    /// File extension for encoded payloads, without the dot.
    fn extension(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug)]
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameEncoder for JpegEncoder {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ImageJpegEncoder::new_with_quality(&mut out, self.quality)
            .encode(
                frame.pixels(),
                frame.width(),
                frame.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(|e| anyhow!("jpeg encoding failed: {}", e))?;
        Ok(out)
    }

    fn extension(&self) -> &'static str {
        "jpg"
    }
}

// ----------------------------------------------------------------------------
// Observers
// ----------------------------------------------------------------------------

/// Live consumer of encoded frames.
pub trait FrameObserver: Send + Sync {
    fn on_frame(&self, encoded: &[u8]) -> Result<()>;
}

/// Registry of frame observers. Registration is identity based (`Arc::ptr_eq`).
pub struct FrameObservers {
    observers: RwLock<Vec<Arc<dyn FrameObserver>>>,
    log: Logger,
}

impl FrameObservers {
    pub fn new(log: Logger) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            log,
        }
    }

    /// Add an observer; adding the same observer twice is a no-op.
    pub fn add(&self, observer: Arc<dyn FrameObserver>) {
        let mut guard = match self.observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !guard.iter().any(|existing| Arc::ptr_eq(existing, &observer)) {
            guard.push(observer);
        }
    }

    pub fn remove(&self, observer: &Arc<dyn FrameObserver>) -> bool {
        let mut guard = match self.observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = guard.len();
        guard.retain(|existing| !Arc::ptr_eq(existing, observer));
        guard.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish one encoded frame to every observer. Observer failures are
    /// logged and never propagated.
    pub fn publish(&self, encoded: &[u8]) {
        let snapshot: Vec<Arc<dyn FrameObserver>> = match self.observers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for observer in snapshot {
            if let Err(e) = observer.on_frame(encoded) {
                log::warn!(target: self.log.target(), "frame observer failed: {:#}", e);
            }
        }
    }
}

/// Keeps the most recent encoded frame for live preview.
#[derive(Default)]
pub struct LatestFrame {
    latest: Mutex<Option<Arc<[u8]>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<[u8]>> {
        self.latest
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(None)
    }
}

impl FrameObserver for LatestFrame {
    fn on_frame(&self, encoded: &[u8]) -> Result<()> {
        let mut guard = self
            .latest
            .lock()
            .map_err(|_| anyhow!("latest frame lock poisoned"))?;
        *guard = Some(Arc::from(encoded));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;

    impl FrameObserver for Failing {
        fn on_frame(&self, _encoded: &[u8]) -> Result<()> {
            Err(anyhow!("preview client gone"))
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl FrameObserver for Counting {
        fn on_frame(&self, _encoded: &[u8]) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn frame_rejects_wrong_buffer_size() {
        assert!(Frame::new(2, 2, vec![0; 12]).is_ok());
        assert!(Frame::new(2, 2, vec![0; 11]).is_err());
    }

    #[test]
    fn luma_of_white_and_black() {
        let white = Frame::filled(1, 1, [255, 255, 255]);
        let black = Frame::filled(1, 1, [0, 0, 0]);
        assert_eq!(white.luma(), vec![255]);
        assert_eq!(black.luma(), vec![0]);
    }

    #[test]
    fn jpeg_encoder_produces_jpeg_magic() {
        let frame = Frame::filled(16, 8, [10, 200, 30]);
        let bytes = JpegEncoder::default().encode(&frame).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(JpegEncoder::default().extension(), "jpg");
    }

    #[test]
    fn failing_observer_does_not_block_others() {
        let observers = FrameObservers::new(Logger::default());
        let counting = Arc::new(Counting::default());
        let latest = Arc::new(LatestFrame::new());
        observers.add(Arc::new(Failing));
        observers.add(counting.clone());
        observers.add(latest.clone());

        observers.publish(b"frame-1");
        observers.publish(b"frame-2");

        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
        assert_eq!(latest.get().as_deref(), Some(&b"frame-2"[..]));
    }

    #[test]
    fn observers_register_once_and_can_be_removed() {
        let observers = FrameObservers::new(Logger::default());
        let counting: Arc<dyn FrameObserver> = Arc::new(Counting::default());
        observers.add(counting.clone());
        observers.add(counting.clone());
        assert_eq!(observers.len(), 1);
        assert!(observers.remove(&counting));
        assert!(!observers.remove(&counting));
        assert!(observers.is_empty());
    }
}
