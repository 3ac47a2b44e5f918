//! Motion analysis.
//!
//! The capture loop hands each frame and the current reference frame to a
//! `FrameAnalyzer` and gets back a `MotionAnalysis`. Analyzers are stateless
//! apart from what the caller passes in.

mod analyzer;
mod backends;
mod result;

pub use analyzer::FrameAnalyzer;
pub use backends::{DifferenceAnalyzer, HashAnalyzer};
pub use result::{MotionAnalysis, Region};

use anyhow::{anyhow, Result};

/// Build an analyzer by name (`difference` or `hash`).
pub fn analyzer_by_name(name: &str) -> Result<Box<dyn FrameAnalyzer>> {
    match name {
        "difference" => Ok(Box::new(DifferenceAnalyzer::default())),
        "hash" => Ok(Box::new(HashAnalyzer)),
        other => Err(anyhow!("unknown analyzer '{}'", other)),
    }
}
