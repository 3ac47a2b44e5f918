//! Capture loop.
//!
//! While the gate is open the loop reads frames, publishes them to observers,
//! asks the analyzer for motion, debounces confirmed motion into `MotionEvent`s
//! and flushes the accumulated batch to the dispatcher once the scene has been
//! quiet for the notification delay.
//!
//! The flush countdown restarts with every new event, so continuous motion
//! postpones notification until the scene settles.

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::clock::{Clock, TaskSet};
use crate::detect::FrameAnalyzer;
use crate::extension::Dispatcher;
use crate::frame::{Frame, FrameEncoder, FrameObservers};
use crate::ingest::{FrameRead, VideoSource};
use crate::log::Logger;
use crate::orchestrator::GateState;

pub const DEFAULT_BATCH_CAPACITY: usize = 10;
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);
pub const DEFAULT_CAPTURE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_REOPEN_INTERVAL: Duration = Duration::from_secs(30);
const GATE_POLL_SLICE: Duration = Duration::from_millis(50);
const EVENT_NAME_PREFIX: &str = "motion_detection";

/// One confirmed motion event. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MotionEvent {
    name: String,
    captured_at: NaiveDateTime,
    payload: Arc<[u8]>,
}

impl MotionEvent {
    pub fn new(name: impl Into<String>, captured_at: NaiveDateTime, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            captured_at,
            payload: Arc::from(payload),
        }
    }

    /// Name derived from the capture time, e.g. `motion_detection-20240101_101530_250.jpg`.
    pub fn at(captured_at: NaiveDateTime, extension: &str, payload: Vec<u8>) -> Self {
        let name = format!(
            "{}-{}.{}",
            EVENT_NAME_PREFIX,
            captured_at.format("%Y%m%d_%H%M%S_%3f"),
            extension
        );
        Self::new(name, captured_at, payload)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn captured_at(&self) -> NaiveDateTime {
        self.captured_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Bounded FIFO of events. Overflow evicts the oldest event.
#[derive(Clone, Debug)]
pub struct EventBatch {
    events: VecDeque<MotionEvent>,
    capacity: usize,
}

impl EventBatch {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an event, returning the evicted one on overflow.
    pub fn push(&mut self, event: MotionEvent) -> Option<MotionEvent> {
        let evicted = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = MotionEvent>) -> usize {
        events
            .into_iter()
            .filter_map(|event| self.push(event))
            .count()
    }

    /// Move the contents out, leaving the batch empty.
    pub fn take(&mut self) -> Vec<MotionEvent> {
        self.events.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MotionEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Suppresses events closer than `window` to the previous one.
#[derive(Clone, Debug)]
pub struct Debouncer {
    window: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Returns true (and records `now`) when an event may be created.
    pub fn admit(&mut self, now: Instant) -> bool {
        let admitted = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.window,
        };
        if admitted {
            self.last = Some(now);
        }
        admitted
    }

    pub fn last(&self) -> Option<Instant> {
        self.last
    }
}

/// Debounce + batch + flush policy, independent of any device.
#[derive(Debug)]
pub struct MotionTracker {
    debouncer: Debouncer,
    batch: EventBatch,
    notification_delay: Duration,
}

impl MotionTracker {
    pub fn new(debounce: Duration, capacity: usize, notification_delay: Duration) -> Self {
        Self {
            debouncer: Debouncer::new(debounce),
            batch: EventBatch::new(capacity),
            notification_delay,
        }
    }

    /// Offer a motion-positive frame. `make_event` runs only when the frame
    /// passes the debounce window; the created event is appended to the batch.
    pub fn offer<F>(&mut self, now: Instant, make_event: F) -> Result<Option<&MotionEvent>>
    where
        F: FnOnce() -> Result<MotionEvent>,
    {
        if !self.debouncer.admit(now) {
            return Ok(None);
        }
        self.batch.push(make_event()?);
        Ok(self.batch.iter().last())
    }

    /// Hand out the batch once the last event is older than the notification
    /// delay. Empty batches are never handed out.
    pub fn take_due(&mut self, now: Instant) -> Option<Vec<MotionEvent>> {
        let last = self.debouncer.last()?;
        if self.batch.is_empty() || now.saturating_duration_since(last) <= self.notification_delay {
            return None;
        }
        Some(self.batch.take())
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }
}

// ----------------------------------------------------------------------------
// CaptureLoop
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub device_name: String,
    pub capture_delay: Duration,
    pub notification_delay: Duration,
    pub debounce: Duration,
    pub batch_capacity: usize,
    pub reopen_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device_name: "Camera 1".to_string(),
            capture_delay: DEFAULT_CAPTURE_DELAY,
            notification_delay: Duration::from_secs(5),
            debounce: DEFAULT_DEBOUNCE,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            reopen_interval: DEFAULT_REOPEN_INTERVAL,
        }
    }
}

/// Counters for one loop instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub not_ready: u64,
    pub read_errors: u64,
    pub events: u64,
    pub flushes: u64,
}

/// How a loop instance ended.
#[derive(Debug)]
pub enum CaptureExit {
    /// Gate closed (stop, schedule or presence); a future edge may relaunch.
    GateClosed(CaptureStats),
    /// Unexpected failure; periodic evaluators have been cancelled.
    Failed(anyhow::Error),
}

/// Everything a loop instance needs. Cheap to clone; all heavy parts are shared.
#[derive(Clone)]
pub struct CaptureLoop {
    pub(crate) source: Arc<Mutex<Box<dyn VideoSource>>>,
    pub(crate) analyzer: Arc<Mutex<Box<dyn FrameAnalyzer>>>,
    pub(crate) encoder: Arc<dyn FrameEncoder>,
    pub(crate) observers: Arc<FrameObservers>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) gate: Arc<GateState>,
    pub(crate) evaluators: TaskSet,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: CaptureSettings,
    pub(crate) log: Logger,
}

impl CaptureLoop {
    /// Run until the gate closes or an unexpected error occurs.
    pub fn run(&self) -> CaptureExit {
        log::info!(target: self.log.target(), "capturing from {}", self.settings.device_name);
        let mut stats = CaptureStats::default();
        match self.capture(&mut stats) {
            Ok(()) => {
                log::info!(
                    target: self.log.target(),
                    "capture stopped: {} frame(s), {} event(s), {} flush(es)",
                    stats.frames,
                    stats.events,
                    stats.flushes
                );
                CaptureExit::GateClosed(stats)
            }
            Err(e) => {
                log::error!(target: self.log.target(), "stopping after failure: {:#}", e);
                let cancelled = self.evaluators.cancel_all();
                log::warn!(
                    target: self.log.target(),
                    "cancelled {} periodic evaluator(s); restart required",
                    cancelled
                );
                CaptureExit::Failed(e)
            }
        }
    }

    fn capture(&self, stats: &mut CaptureStats) -> Result<()> {
        let mut source = self
            .source
            .lock()
            .map_err(|_| anyhow!("video source lock poisoned"))?;
        let analyzer = self
            .analyzer
            .lock()
            .map_err(|_| anyhow!("analyzer lock poisoned"))?;
        let mut tracker = MotionTracker::new(
            self.settings.debounce,
            self.settings.batch_capacity,
            self.settings.notification_delay,
        );
        let queue = DispatchQueue::spawn(self.dispatcher.clone(), self.log.child("dispatch"))?;
        let mut reference: Option<Frame> = None;
        let mut last_open_attempt: Option<Instant> = None;

        self.try_open(&mut **source, &mut last_open_attempt);
        let result = loop {
            if !self.gate.capture_allowed() {
                break Ok(());
            }
            if let Err(e) = self.iterate(
                &mut **source,
                &**analyzer,
                &mut tracker,
                &mut reference,
                &mut last_open_attempt,
                &queue,
                stats,
            ) {
                break Err(e);
            }
            self.pause(self.settings.capture_delay);
        };
        if tracker.pending() > 0 {
            log::info!(
                target: self.log.target(),
                "dropping {} unflushed event(s) on capture exit",
                tracker.pending()
            );
        }
        source.close();
        result
    }

    fn iterate(
        &self,
        source: &mut dyn VideoSource,
        analyzer: &dyn FrameAnalyzer,
        tracker: &mut MotionTracker,
        reference: &mut Option<Frame>,
        last_open_attempt: &mut Option<Instant>,
        queue: &DispatchQueue,
        stats: &mut CaptureStats,
    ) -> Result<()> {
        let frame = match source.read() {
            Ok(FrameRead::Frame(frame)) => frame,
            Ok(FrameRead::NotReady) => {
                stats.not_ready += 1;
                if !source.is_open() {
                    self.try_open(source, last_open_attempt);
                }
                return Ok(());
            }
            Err(e) => {
                stats.read_errors += 1;
                log::warn!(target: self.log.target(), "frame read failed: {:#}", e);
                return Ok(());
            }
        };
        stats.frames += 1;
        let now = self.clock.now();

        let mut encoded: Option<Vec<u8>> = None;
        if !self.observers.is_empty() {
            let bytes = self.encoder.encode(&frame)?;
            self.observers.publish(&bytes);
            encoded = Some(bytes);
        }

        let analysis = match reference.as_ref() {
            Some(previous) => analyzer.detect_motion(&frame, previous)?,
            None => {
                *reference = Some(analyzer.prepare(&frame));
                return Ok(());
            }
        };

        if analysis.motion_present {
            let captured_at = self.clock.local();
            let created = tracker.offer(now, || {
                let payload = match encoded.take() {
                    Some(bytes) => bytes,
                    None => self.encoder.encode(&frame)?,
                };
                Ok(MotionEvent::at(captured_at, self.encoder.extension(), payload))
            })?;
            if let Some(event) = created {
                stats.events += 1;
                log::info!(target: self.log.target(), "motion detected and stored to {}", event.name());
                *reference = Some(analysis.reference);
            }
        }

        if let Some(events) = tracker.take_due(now) {
            stats.flushes += 1;
            self.hand_off(queue, events)?;
        }
        Ok(())
    }

    fn try_open(&self, source: &mut dyn VideoSource, last_attempt: &mut Option<Instant>) {
        let now = self.clock.now();
        if last_attempt.is_some_and(|at| now.saturating_duration_since(at) < self.settings.reopen_interval) {
            return;
        }
        *last_attempt = Some(now);
        if let Err(e) = source.open() {
            log::warn!(
                target: self.log.target(),
                "device {} is not available: {:#}",
                source.name(),
                e
            );
        }
    }

    /// Pass a batch to the dispatcher without blocking the next frame read.
    fn hand_off(&self, queue: &DispatchQueue, events: Vec<MotionEvent>) -> Result<()> {
        let message = format!(
            "Motion detected using {} ({} event(s))",
            self.settings.device_name,
            events.len()
        );
        log::info!(target: self.log.target(), "dispatching {} event(s)", events.len());
        queue.send(events, message)
    }

    /// Sleep, waking early once the gate closes.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        loop {
            let now = Instant::now();
            if now >= deadline || !self.gate.capture_allowed() {
                return;
            }
            thread::sleep((deadline - now).min(GATE_POLL_SLICE));
        }
    }
}

/// Single dispatch worker for one loop instance. Batches reach the
/// extensions in flush order; the worker drains what is queued and exits once
/// the loop drops its queue.
struct DispatchQueue {
    tx: mpsc::Sender<(Vec<MotionEvent>, String)>,
}

impl DispatchQueue {
    fn spawn(dispatcher: Arc<Dispatcher>, log: Logger) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<(Vec<MotionEvent>, String)>();
        thread::Builder::new()
            .name("dispatch".to_string())
            .spawn(move || {
                for (events, message) in rx {
                    let report = dispatcher.dispatch(&events, &message);
                    log::debug!(
                        target: log.target(),
                        "{} event(s) delivered by {} extension(s)",
                        events.len(),
                        report.delivered()
                    );
                }
            })
            .map_err(|e| anyhow!("failed to spawn dispatch thread: {}", e))?;
        Ok(Self { tx })
    }

    fn send(&self, events: Vec<MotionEvent>, message: String) -> Result<()> {
        self.tx
            .send((events, message))
            .map_err(|_| anyhow!("dispatch worker exited"))
    }
}
