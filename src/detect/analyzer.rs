use anyhow::Result;

use crate::detect::result::MotionAnalysis;
use crate::frame::Frame;

/// Frame analyzer.
///
/// Compares `frame` against the caller-held `reference` and reports whether
/// motion is present. `MotionAnalysis::reference` is the prepared form of
/// `frame` that the caller adopts as its new reference once it confirms an
/// event; the analyzer itself keeps no state between calls.
pub trait FrameAnalyzer: Send {
    /// Analyzer identifier.
    fn name(&self) -> &'static str;

    /// Prepare a frame for use as a reference (e.g. grayscale + blur).
    fn prepare(&self, frame: &Frame) -> Frame;

    /// Compare a frame against a prepared reference.
    fn detect_motion(&self, frame: &Frame, reference: &Frame) -> Result<MotionAnalysis>;
}
