use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::analyzer::FrameAnalyzer;
use crate::detect::result::MotionAnalysis;
use crate::frame::Frame;

/// Exact-change analyzer. Any byte difference from the reference is motion.
///
/// Meant for synthetic sources and tests, where frames are either identical or
/// deliberately different.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashAnalyzer;

fn digest(frame: &Frame) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(frame.width().to_le_bytes());
    hasher.update(frame.height().to_le_bytes());
    hasher.update(frame.pixels());
    hasher.finalize().into()
}

impl FrameAnalyzer for HashAnalyzer {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn prepare(&self, frame: &Frame) -> Frame {
        frame.clone()
    }

    fn detect_motion(&self, frame: &Frame, reference: &Frame) -> Result<MotionAnalysis> {
        Ok(MotionAnalysis {
            motion_present: digest(frame) != digest(reference),
            region: None,
            annotated: None,
            reference: frame.clone(),
        })
    }
}
