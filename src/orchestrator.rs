//! Gated-capture orchestrator.
//!
//! Two periodic evaluators maintain the gate flags:
//! - activation: is the local time inside today's activation window?
//! - presence: is a trusted device on the local network?
//!
//! Capture runs while `running && activated && !suspended`. Each evaluator
//! reports edges only; an edge that opens the gate launches a capture loop
//! unless one is already active. Closing the gate never interrupts the loop
//! directly, the loop notices on its own polling and exits.
//!
//! Locks:
//! - `lifecycle` serializes `start` / `stop` / `restart`.
//! - `capture` (the launch lock) serializes loop launch against concurrent
//!   edges and holds the active-loop token.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::capture::{CaptureExit, CaptureLoop, CaptureSettings};
use crate::clock::{Clock, PeriodicTask, TaskSet};
use crate::detect::FrameAnalyzer;
use crate::extension::Dispatcher;
use crate::frame::{FrameEncoder, FrameObserver, FrameObservers};
use crate::ingest::VideoSource;
use crate::log::Logger;
use crate::presence::{PresenceEvaluator, ScanResult, TrustedDeviceSet};
use crate::schedule::ActivationSchedule;

pub const DEFAULT_ACTIVATION_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_PRESENCE_PERIOD: Duration = Duration::from_secs(120);
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Shared gate flags.
#[derive(Debug)]
pub struct GateState {
    running: AtomicBool,
    activated: AtomicBool,
    suspended: AtomicBool,
}

impl Default for GateState {
    fn default() -> Self {
        Self::new()
    }
}

impl GateState {
    /// Stopped, not activated, suspended: the first evaluation of each flag is
    /// always an edge.
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            activated: AtomicBool::new(false),
            suspended: AtomicBool::new(true),
        }
    }

    pub fn capture_allowed(&self) -> bool {
        self.is_running() && self.is_activated() && !self.is_suspended()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn open_run(&self) {
        self.activated.store(false, Ordering::SeqCst);
        self.suspended.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    /// Returns whether the orchestrator was running.
    fn close_run(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    /// Returns the previous value.
    fn set(&self, flag: Flag, value: bool) -> bool {
        match flag {
            Flag::Activated => self.activated.swap(value, Ordering::SeqCst),
            Flag::Suspended => self.suspended.swap(value, Ordering::SeqCst),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flag {
    Activated,
    Suspended,
}

/// Everything the evaluators and the capture loop read. Replaced wholesale.
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub schedule: ActivationSchedule,
    pub trusted: TrustedDeviceSet,
    pub capture: CaptureSettings,
    /// Applied on the next `start`.
    pub activation_period: Duration,
    /// Applied on the next `start`.
    pub presence_period: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            schedule: ActivationSchedule::always(),
            trusted: TrustedDeviceSet::new(),
            capture: CaptureSettings::default(),
            activation_period: DEFAULT_ACTIVATION_PERIOD,
            presence_period: DEFAULT_PRESENCE_PERIOD,
        }
    }
}

/// Point-in-time view for status pages and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Status {
    pub running: bool,
    pub activated: bool,
    pub suspended: bool,
    pub capture_active: bool,
    pub capture_launches: u64,
}

/// Collaborators handed to the orchestrator.
pub struct Components {
    pub source: Box<dyn VideoSource>,
    pub analyzer: Box<dyn FrameAnalyzer>,
    pub encoder: Arc<dyn FrameEncoder>,
    pub dispatcher: Arc<Dispatcher>,
    pub presence: PresenceEvaluator,
    pub clock: Arc<dyn Clock>,
}

struct ActiveCapture {
    id: u64,
    handle: JoinHandle<()>,
}

struct Shared {
    gate: Arc<GateState>,
    lifecycle: Mutex<()>,
    evaluators: TaskSet,
    capture: Mutex<Option<ActiveCapture>>,
    settings: RwLock<Arc<OrchestratorSettings>>,
    source: Arc<Mutex<Box<dyn VideoSource>>>,
    analyzer: Arc<Mutex<Box<dyn FrameAnalyzer>>>,
    encoder: Arc<dyn FrameEncoder>,
    observers: Arc<FrameObservers>,
    dispatcher: Arc<Dispatcher>,
    presence: PresenceEvaluator,
    clock: Arc<dyn Clock>,
    launches: AtomicU64,
    log: Logger,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(components: Components, settings: OrchestratorSettings, log: Logger) -> Self {
        let observers = Arc::new(FrameObservers::new(log.child("observers")));
        let shared = Shared {
            gate: Arc::new(GateState::new()),
            lifecycle: Mutex::new(()),
            evaluators: TaskSet::new(),
            capture: Mutex::new(None),
            settings: RwLock::new(Arc::new(settings)),
            source: Arc::new(Mutex::new(components.source)),
            analyzer: Arc::new(Mutex::new(components.analyzer)),
            encoder: components.encoder,
            observers,
            dispatcher: components.dispatcher,
            presence: components.presence,
            clock: components.clock,
            launches: AtomicU64::new(0),
            log,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Start the evaluators. Starting a running orchestrator is a no-op.
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.shared.lock_lifecycle();
        Shared::start_locked(&self.shared)
    }

    /// Stop evaluators and capture. Idempotent.
    pub fn stop(&self) {
        let _lifecycle = self.shared.lock_lifecycle();
        self.shared.stop_locked();
    }

    /// Stop, give device handles a moment to settle, start again.
    pub fn restart(&self) -> Result<()> {
        let _lifecycle = self.shared.lock_lifecycle();
        self.shared.stop_locked();
        thread::sleep(RESTART_DELAY);
        Shared::start_locked(&self.shared)
    }

    pub fn is_running(&self) -> bool {
        self.shared.gate.is_running()
    }

    pub fn is_activated(&self) -> bool {
        self.shared.gate.is_activated()
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.gate.is_suspended()
    }

    pub fn capture_allowed(&self) -> bool {
        self.shared.gate.capture_allowed()
    }

    /// Number of capture loops launched since construction.
    pub fn capture_launches(&self) -> u64 {
        self.shared.launches.load(Ordering::SeqCst)
    }

    /// Last successful network scan, for device pickers.
    pub fn scan_results(&self) -> Option<Vec<ScanResult>> {
        self.shared.presence.scan_results()
    }

    pub fn add_frame_observer(&self, observer: Arc<dyn FrameObserver>) {
        self.shared.observers.add(observer);
    }

    pub fn remove_frame_observer(&self, observer: &Arc<dyn FrameObserver>) -> bool {
        self.shared.observers.remove(observer)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.shared.dispatcher
    }

    pub fn settings(&self) -> Arc<OrchestratorSettings> {
        self.shared.settings()
    }

    /// Replace settings. Evaluators pick them up on their next tick; capture
    /// settings apply to the next loop launched.
    pub fn update_settings(&self, settings: OrchestratorSettings) {
        let settings = Arc::new(settings);
        match self.shared.settings.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
        log::info!(target: self.shared.log.target(), "settings updated");
    }

    /// Run both evaluations now on the calling thread, outside the periodic
    /// schedule.
    pub fn reevaluate(&self) {
        self.shared.evaluate_activation();
        self.shared.evaluate_presence();
    }

    pub fn status(&self) -> Status {
        let gate = &self.shared.gate;
        Status {
            running: gate.is_running(),
            activated: gate.is_activated(),
            suspended: gate.is_suspended(),
            capture_active: self.shared.capture_active(),
            capture_launches: self.capture_launches(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_capture(&self) -> MutexGuard<'_, Option<ActiveCapture>> {
        self.capture
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settings(&self) -> Arc<OrchestratorSettings> {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn capture_active(&self) -> bool {
        self.lock_capture()
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    fn start_locked(this: &Arc<Self>) -> Result<()> {
        if this.gate.is_running() {
            log::debug!(target: this.log.target(), "already running");
            return Ok(());
        }
        let settings = this.settings();
        this.gate.open_run();
        log::info!(
            target: this.log.target(),
            "starting (activation every {:?}, presence every {:?})",
            settings.activation_period,
            settings.presence_period
        );

        let spawned = Self::spawn_evaluator(this, "activation", settings.activation_period, Self::evaluate_activation)
            .and_then(|_| {
                Self::spawn_evaluator(this, "presence", settings.presence_period, Self::evaluate_presence)
            });
        if let Err(e) = spawned {
            this.gate.close_run();
            this.evaluators.cancel_all();
            return Err(e);
        }
        Ok(())
    }

    fn spawn_evaluator(
        this: &Arc<Self>,
        name: &str,
        period: Duration,
        evaluate: fn(&Self),
    ) -> Result<()> {
        let weak: Weak<Self> = Arc::downgrade(this);
        let task = PeriodicTask::spawn(name, period, &this.log.child(name), move || {
            if let Some(shared) = weak.upgrade() {
                evaluate(&shared);
            }
        })?;
        this.evaluators.push(task);
        Ok(())
    }

    fn stop_locked(&self) {
        if !self.gate.close_run() {
            log::debug!(target: self.log.target(), "already stopped");
            return;
        }
        let cancelled = self.evaluators.cancel_all();
        log::info!(target: self.log.target(), "stopping ({} evaluator(s) cancelled)", cancelled);

        let active = self.lock_capture().take();
        if let Some(active) = active {
            if active.handle.thread().id() == thread::current().id() {
                log::debug!(target: self.log.target(), "stop requested from capture loop {}", active.id);
            } else if active.handle.join().is_err() {
                log::warn!(target: self.log.target(), "capture loop {} panicked", active.id);
            }
        }
    }

    fn evaluate_activation(&self) {
        if !self.gate.is_running() {
            return;
        }
        let settings = self.settings();
        let now = self.clock.local();
        let activated = settings.schedule.is_activated(now);
        log::debug!(target: self.log.target(), "activation check at {}: {}", now, activated);
        self.apply_edge(Flag::Activated, activated);
    }

    fn evaluate_presence(&self) {
        if !self.gate.is_running() {
            return;
        }
        let settings = self.settings();
        match self.presence.evaluate(&settings.trusted) {
            Ok(suspended) => {
                log::debug!(target: self.log.target(), "presence check: suspended={}", suspended);
                self.apply_edge(Flag::Suspended, suspended);
            }
            Err(e) => log::warn!(
                target: self.log.target(),
                "network scan failed, keeping suspended={}: {:#}",
                self.gate.is_suspended(),
                e
            ),
        }
    }

    fn apply_edge(&self, flag: Flag, value: bool) {
        if self.gate.set(flag, value) == value {
            return;
        }
        log::info!(
            target: self.log.target(),
            "activated: {}, suspended: {}",
            self.gate.is_activated(),
            self.gate.is_suspended()
        );
        if self.gate.capture_allowed() {
            if let Err(e) = self.launch_capture() {
                log::error!(target: self.log.target(), "capture launch failed: {:#}", e);
            }
        }
    }

    /// Launch a capture loop if the gate is open and none is active.
    fn launch_capture(&self) -> Result<()> {
        let mut slot = self.lock_capture();
        if !self.gate.capture_allowed() {
            return Ok(());
        }
        if let Some(active) = slot.as_ref() {
            if !active.handle.is_finished() {
                log::debug!(target: self.log.target(), "capture loop {} already active", active.id);
                return Ok(());
            }
        }
        if let Some(finished) = slot.take() {
            let _ = finished.handle.join();
        }

        let settings = self.settings();
        let id = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let capture = CaptureLoop {
            source: self.source.clone(),
            analyzer: self.analyzer.clone(),
            encoder: self.encoder.clone(),
            observers: self.observers.clone(),
            dispatcher: self.dispatcher.clone(),
            gate: self.gate.clone(),
            evaluators: self.evaluators.clone(),
            clock: self.clock.clone(),
            settings: settings.capture.clone(),
            log: self.log.child("capture"),
        };
        let loop_log = self.log.clone();
        let handle = thread::Builder::new()
            .name(format!("capture-{}", id))
            .spawn(move || match capture.run() {
                CaptureExit::GateClosed(_) => {
                    log::debug!(target: loop_log.target(), "capture loop {} exited", id)
                }
                CaptureExit::Failed(_) => {
                    log::warn!(target: loop_log.target(), "capture loop {} failed", id)
                }
            })
            .map_err(|e| anyhow!("failed to spawn capture loop: {}", e))?;
        log::info!(target: self.log.target(), "capture loop {} launched", id);
        *slot = Some(ActiveCapture { id, handle });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::detect::HashAnalyzer;
    use crate::frame::JpegEncoder;
    use crate::ingest::synthetic::{SyntheticConfig, SyntheticSource};
    use crate::presence::{LocalAddress, NetworkScanner};
    use crate::schedule::DayWindow;
    use chrono::{NaiveDate, Weekday};
    use std::net::Ipv4Addr;
    use std::time::Instant;

    struct EmptyNetwork;

    impl NetworkScanner for EmptyNetwork {
        fn scan(&self, _local: Ipv4Addr) -> Result<Vec<ScanResult>> {
            Ok(Vec::new())
        }
    }

    impl LocalAddress for EmptyNetwork {
        fn find_local_ipv4(&self) -> Ipv4Addr {
            Ipv4Addr::LOCALHOST
        }
    }

    fn orchestrator(settings: OrchestratorSettings, clock: Arc<ManualClock>) -> Orchestrator {
        let log = Logger::default();
        let source = SyntheticSource::new(
            SyntheticConfig {
                width: 16,
                height: 16,
                ..SyntheticConfig::default()
            },
            log.clone(),
        );
        Orchestrator::new(
            Components {
                source: Box::new(source),
                analyzer: Box::new(HashAnalyzer),
                encoder: Arc::new(JpegEncoder::default()),
                dispatcher: Arc::new(Dispatcher::new(log.clone())),
                presence: PresenceEvaluator::new(Box::new(EmptyNetwork), Box::new(EmptyNetwork), log.clone()),
                clock,
            },
            settings,
            log,
        )
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn monday(h: u32, m: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn fast_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            capture: CaptureSettings {
                capture_delay: Duration::from_millis(10),
                ..CaptureSettings::default()
            },
            activation_period: Duration::from_millis(20),
            presence_period: Duration::from_millis(20),
            ..OrchestratorSettings::default()
        }
    }

    #[test]
    fn new_gate_is_closed_and_suspended() {
        let gate = GateState::new();
        assert!(!gate.is_running());
        assert!(!gate.is_activated());
        assert!(gate.is_suspended());
        assert!(!gate.capture_allowed());
    }

    #[test]
    fn gate_requires_all_three_conditions() {
        let gate = GateState::new();
        gate.open_run();
        assert!(!gate.set(Flag::Activated, true));
        assert!(!gate.capture_allowed());
        assert!(gate.set(Flag::Suspended, false));
        assert!(gate.capture_allowed());
        assert!(gate.close_run());
        assert!(!gate.capture_allowed());
        assert!(!gate.close_run());
    }

    #[test]
    fn outside_window_never_launches() {
        let clock = Arc::new(ManualClock::new(monday(8, 0)));
        let mut settings = fast_settings();
        settings.schedule =
            ActivationSchedule::default().with_window(Weekday::Mon, DayWindow::parse("09:00", "10:00").unwrap());
        let orchestrator = orchestrator(settings, clock);

        orchestrator.start().unwrap();
        assert!(wait_for(|| !orchestrator.is_suspended()));
        thread::sleep(Duration::from_millis(100));
        assert!(!orchestrator.is_activated());
        assert_eq!(orchestrator.capture_launches(), 0);
        orchestrator.stop();
    }

    #[test]
    fn open_gate_launches_one_loop_and_stop_closes_it() {
        let clock = Arc::new(ManualClock::new(monday(12, 0)));
        let orchestrator = orchestrator(fast_settings(), clock);

        orchestrator.start().unwrap();
        assert!(wait_for(|| orchestrator.status().capture_active));
        for _ in 0..5 {
            orchestrator.reevaluate();
        }
        assert_eq!(orchestrator.capture_launches(), 1);

        orchestrator.stop();
        let status = orchestrator.status();
        assert!(!status.running);
        assert!(!status.capture_active);
        orchestrator.stop();
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn restart_resets_flags_and_relaunches() {
        let clock = Arc::new(ManualClock::new(monday(12, 0)));
        let orchestrator = orchestrator(fast_settings(), clock);

        orchestrator.start().unwrap();
        assert!(wait_for(|| orchestrator.capture_launches() == 1));
        orchestrator.restart().unwrap();
        assert!(orchestrator.is_running());
        assert!(wait_for(|| orchestrator.capture_launches() == 2));
        orchestrator.stop();
    }
}
