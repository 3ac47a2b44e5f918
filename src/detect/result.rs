use crate::frame::Frame;

/// Result of analyzing one frame against the reference.
#[derive(Clone, Debug)]
pub struct MotionAnalysis {
    /// Did the frame differ enough from the reference?
    pub motion_present: bool,
    /// Bounding box of the changed area, when known.
    pub region: Option<Region>,
    /// Frame with the changed area outlined (for display only).
    pub annotated: Option<Frame>,
    /// Prepared form of the analyzed frame, candidate for the next reference.
    pub reference: Frame,
}

/// Pixel-space bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Region {
    pub fn area(&self) -> u64 {
        u64::from(self.w) * u64::from(self.h)
    }
}
