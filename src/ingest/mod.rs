//! Video sources.
//!
//! Every source implements the `VideoSource` capability:
//! - `open`: acquire the device (idempotent)
//! - `read`: return the next frame, or `FrameRead::NotReady` when the device
//!   is not open yet or has nothing to hand out
//! - `close`: release the device (idempotent)
//!
//! Expected "not ready" states are values, not errors. `read` errors are
//! transient I/O failures; the capture loop logs them and retries.
//!
//! Sources:
//! - `stub://<name>`: synthetic scene with a periodic change (testing, demos)
//! - a local directory of JPEG/PNG stills, replayed in name order

use anyhow::Result;

use crate::frame::Frame;
use crate::log::Logger;

pub mod stills;
pub mod synthetic;

pub use stills::StillsSource;
pub use synthetic::SyntheticSource;

pub const STUB_SCHEME: &str = "stub://";

/// Outcome of a single read.
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    NotReady,
}

pub trait VideoSource: Send {
    /// Human-readable source identifier (URL or path).
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<()>;

    fn read(&mut self) -> Result<FrameRead>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Counters shared by all sources.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_read: u64,
    pub not_ready: u64,
    pub opens: u64,
}

/// Build a source from its configured location.
pub fn open_source(location: &str, log: &Logger) -> Result<Box<dyn VideoSource>> {
    if location.starts_with(STUB_SCHEME) {
        Ok(Box::new(SyntheticSource::new(
            synthetic::SyntheticConfig {
                url: location.to_string(),
                ..synthetic::SyntheticConfig::default()
            },
            log.child("source"),
        )))
    } else {
        Ok(Box::new(StillsSource::new(location, log.child("source"))?))
    }
}
