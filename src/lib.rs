//! Motion Gate
//!
//! Gated motion capture: a camera is read, and motion is reported, only while
//! the current time falls inside a configured activation window AND no trusted
//! device (a phone, say) is present on the local network.
//!
//! # Architecture
//!
//! The gate is `running && activated && !suspended`:
//!
//! 1. **Activation**: per-weekday time windows, re-evaluated periodically.
//! 2. **Suspension**: trusted MAC addresses, matched against a local network scan.
//! 3. **Capture**: while the gate is open, frames are analyzed for motion,
//!    debounced into events and batched.
//! 4. **Notification**: a batch is flushed once the scene has been quiet for the
//!    notification delay, then fanned out to extensions, each throttled on its
//!    own triggering interval.
//!
//! # Module Structure
//!
//! - `clock`: time sources and cancellable periodic tasks
//! - `log`: per-component logger handles
//! - `schedule`: activation windows
//! - `presence`: trusted devices and the suspension evaluator
//! - `net`: local address discovery and ARP-table scanning
//! - `frame`: frames, encoding and frame observers
//! - `ingest`: video sources (synthetic, still images)
//! - `detect`: motion analyzers
//! - `capture`: debounce, batching and the capture loop
//! - `extension`: throttled notification extensions (mail, upload)
//! - `orchestrator`: gate state machine and lifecycle
//! - `config`: daemon configuration

pub mod capture;
pub mod clock;
pub mod config;
pub mod detect;
pub mod extension;
pub mod frame;
pub mod ingest;
pub mod log;
pub mod net;
pub mod orchestrator;
pub mod presence;
pub mod schedule;

pub use capture::{CaptureSettings, Debouncer, EventBatch, MotionEvent};
pub use clock::{Clock, ManualClock, PeriodicTask, SystemClock};
pub use detect::{analyzer_by_name, DifferenceAnalyzer, FrameAnalyzer, HashAnalyzer, MotionAnalysis};
pub use extension::{
    Dispatcher, Extension, ExtensionConfig, ExtensionHandle, FtpUploader, SmtpNotifier, Submission,
};
pub use frame::{Frame, FrameEncoder, FrameObserver, JpegEncoder, LatestFrame};
pub use ingest::{open_source, FrameRead, VideoSource};
pub use log::Logger;
pub use orchestrator::{Components, GateState, Orchestrator, OrchestratorSettings, Status};
pub use presence::{
    is_suspended, MacAddress, NetworkScanner, PresenceEvaluator, ScanResult, TrustedDeviceSet,
};
pub use schedule::{is_activated, ActivationSchedule, DayWindow, PeriodEntry};
