use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{NaiveDate, NaiveDateTime, Weekday};

use motion_gate::ingest::SourceStats;
use motion_gate::presence::LocalAddress;
use motion_gate::{
    ActivationSchedule, CaptureSettings, Components, DayWindow, Dispatcher, Extension,
    ExtensionConfig, ExtensionHandle, Frame, FrameAnalyzer, FrameObserver, FrameRead, HashAnalyzer,
    JpegEncoder, Logger, ManualClock, MotionAnalysis, MotionEvent, NetworkScanner, Orchestrator,
    OrchestratorSettings, PresenceEvaluator, ScanResult, TrustedDeviceSet, VideoSource,
};

const PHONE: &str = "40:40:A7:92:F5:00";

/// Scanner whose visible hosts and availability tests can flip at will.
#[derive(Clone, Default)]
struct FakeNetwork {
    hosts: Arc<Mutex<Vec<ScanResult>>>,
    down: Arc<AtomicBool>,
    scans: Arc<AtomicUsize>,
}

impl FakeNetwork {
    fn show_phone(&self, visible: bool) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.clear();
        if visible {
            hosts.push(ScanResult {
                ipv4: Ipv4Addr::new(192, 168, 1, 20),
                mac: Some(PHONE.parse().unwrap()),
                hostname: Some("phone".into()),
            });
        }
    }
}

impl NetworkScanner for FakeNetwork {
    fn scan(&self, _local: Ipv4Addr) -> Result<Vec<ScanResult>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        Ok(self.hosts.lock().unwrap().clone())
    }
}

impl LocalAddress for FakeNetwork {
    fn find_local_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, 10)
    }
}

/// Source showing a flat scene whose shade the test controls.
struct ScriptedSource {
    shade: Arc<AtomicU8>,
    open: bool,
    stats: SourceStats,
}

impl VideoSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        self.stats.opens += 1;
        Ok(())
    }

    fn read(&mut self) -> Result<FrameRead> {
        if !self.open {
            self.stats.not_ready += 1;
            return Ok(FrameRead::NotReady);
        }
        self.stats.frames_read += 1;
        let shade = self.shade.load(Ordering::SeqCst);
        Ok(FrameRead::Frame(Frame::filled(8, 8, [shade; 3])))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

#[derive(Clone, Default)]
struct CountingExtension {
    delivered: Arc<AtomicUsize>,
}

impl Extension for CountingExtension {
    fn kind(&self) -> &'static str {
        "Counting"
    }

    fn deliver(&mut self, events: &[MotionEvent], _message: &str, _config: &ExtensionConfig) -> Result<()> {
        self.delivered.fetch_add(events.len(), Ordering::SeqCst);
        Ok(())
    }
}

/// Accepts a reference frame, then fails on every comparison.
struct BrokenAnalyzer;

impl FrameAnalyzer for BrokenAnalyzer {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn prepare(&self, frame: &Frame) -> Frame {
        frame.clone()
    }

    fn detect_motion(&self, _frame: &Frame, _reference: &Frame) -> Result<MotionAnalysis> {
        Err(anyhow!("analyzer model unavailable"))
    }
}

#[derive(Default)]
struct CountingObserver {
    frames: AtomicUsize,
}

impl FrameObserver for CountingObserver {
    fn on_frame(&self, _encoded: &[u8]) -> Result<()> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    clock: Arc<ManualClock>,
    network: FakeNetwork,
    shade: Arc<AtomicU8>,
    delivered: Arc<AtomicUsize>,
}

fn monday(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

fn harness(start_at: NaiveDateTime, trusted: TrustedDeviceSet, notification_delay: Duration) -> Harness {
    harness_with(start_at, trusted, notification_delay, Box::new(HashAnalyzer))
}

fn harness_with(
    start_at: NaiveDateTime,
    trusted: TrustedDeviceSet,
    notification_delay: Duration,
    analyzer: Box<dyn FrameAnalyzer>,
) -> Harness {
    let log = Logger::default();
    let clock = Arc::new(ManualClock::new(start_at));
    let network = FakeNetwork::default();
    let extension = CountingExtension::default();
    let delivered = extension.delivered.clone();

    let mut dispatcher = Dispatcher::new(log.clone());
    dispatcher.register(ExtensionHandle::new(
        Box::new(extension),
        ExtensionConfig::enabled(),
        clock.clone(),
        &log,
    ));

    let settings = OrchestratorSettings {
        schedule: ActivationSchedule::default()
            .with_window(Weekday::Mon, DayWindow::parse("09:00", "17:00").unwrap()),
        trusted,
        capture: CaptureSettings {
            capture_delay: Duration::from_millis(5),
            notification_delay,
            ..CaptureSettings::default()
        },
        activation_period: Duration::from_millis(20),
        presence_period: Duration::from_millis(20),
    };
    let shade = Arc::new(AtomicU8::new(40));
    let source = ScriptedSource {
        shade: shade.clone(),
        open: false,
        stats: SourceStats::default(),
    };
    let orchestrator = Orchestrator::new(
        Components {
            source: Box::new(source),
            analyzer,
            encoder: Arc::new(JpegEncoder::default()),
            dispatcher: Arc::new(dispatcher),
            presence: PresenceEvaluator::new(
                Box::new(network.clone()),
                Box::new(network.clone()),
                log.clone(),
            ),
            clock: clock.clone(),
        },
        settings,
        log,
    );
    Harness {
        orchestrator: Arc::new(orchestrator),
        clock,
        network,
        shade,
        delivered,
    }
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

fn trusted_phone() -> TrustedDeviceSet {
    TrustedDeviceSet::from_labels([(PHONE, "phone")]).unwrap()
}

#[test]
fn closed_window_keeps_capture_off_even_when_not_suspended() {
    let h = harness(monday(7, 30), TrustedDeviceSet::new(), Duration::from_secs(5));
    h.orchestrator.start().unwrap();

    assert!(wait_for(|| !h.orchestrator.is_suspended()));
    thread::sleep(Duration::from_millis(100));
    assert!(!h.orchestrator.is_activated());
    assert!(!h.orchestrator.capture_allowed());
    assert_eq!(h.orchestrator.capture_launches(), 0);

    h.orchestrator.stop();
}

#[test]
fn opening_window_launches_exactly_one_loop_under_concurrent_ticks() {
    let h = harness(monday(8, 59), TrustedDeviceSet::new(), Duration::from_secs(5));
    h.orchestrator.start().unwrap();
    assert!(wait_for(|| !h.orchestrator.is_suspended()));
    assert_eq!(h.orchestrator.capture_launches(), 0);

    h.clock.set_local(monday(9, 0));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    orchestrator.reevaluate();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(wait_for(|| h.orchestrator.status().capture_active));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(h.orchestrator.capture_launches(), 1);

    h.orchestrator.stop();
    assert!(!h.orchestrator.status().capture_active);
}

#[test]
fn trusted_device_suspends_and_resumes_capture() {
    let h = harness(monday(10, 0), trusted_phone(), Duration::from_secs(5));
    h.network.show_phone(true);
    h.orchestrator.start().unwrap();

    assert!(wait_for(|| h.orchestrator.is_activated()));
    thread::sleep(Duration::from_millis(100));
    assert!(h.orchestrator.is_suspended());
    assert_eq!(h.orchestrator.capture_launches(), 0);
    let seen = h.orchestrator.scan_results().unwrap();
    assert_eq!(seen[0].mac.as_ref().unwrap().as_str(), PHONE);

    h.network.show_phone(false);
    assert!(wait_for(|| h.orchestrator.status().capture_active));

    h.network.show_phone(true);
    assert!(wait_for(|| !h.orchestrator.status().capture_active));
    assert!(h.orchestrator.is_running());

    h.orchestrator.stop();
    assert_eq!(h.orchestrator.capture_launches(), 1);
}

#[test]
fn failing_scan_keeps_previous_suspension() {
    let h = harness(monday(10, 0), trusted_phone(), Duration::from_secs(5));
    h.orchestrator.start().unwrap();
    assert!(wait_for(|| h.orchestrator.status().capture_active));

    h.network.down.store(true, Ordering::SeqCst);
    let scans = h.network.scans.load(Ordering::SeqCst);
    assert!(wait_for(|| h.network.scans.load(Ordering::SeqCst) > scans + 3));
    assert!(!h.orchestrator.is_suspended());
    assert!(h.orchestrator.status().capture_active);

    h.orchestrator.stop();
}

#[test]
fn quiet_scene_flushes_batch_to_extensions() {
    let h = harness(monday(10, 0), TrustedDeviceSet::new(), Duration::ZERO);
    h.orchestrator.start().unwrap();
    assert!(wait_for(|| h.orchestrator.status().capture_active));
    thread::sleep(Duration::from_millis(50));

    // One scene change; the reference then follows the new scene.
    h.shade.store(220, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(h.delivered.load(Ordering::SeqCst), 0);

    h.clock.advance(Duration::from_millis(10));
    assert!(wait_for(|| h.delivered.load(Ordering::SeqCst) == 1));

    h.orchestrator.stop();
}

#[test]
fn observers_receive_frames_until_removed() {
    let h = harness(monday(10, 0), TrustedDeviceSet::new(), Duration::from_secs(5));
    let observer = Arc::new(CountingObserver::default());
    let as_dyn: Arc<dyn FrameObserver> = observer.clone();
    h.orchestrator.add_frame_observer(as_dyn.clone());
    h.orchestrator.start().unwrap();

    assert!(wait_for(|| observer.frames.load(Ordering::SeqCst) >= 3));
    assert!(h.orchestrator.remove_frame_observer(&as_dyn));
    thread::sleep(Duration::from_millis(50));
    let after_removal = observer.frames.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(observer.frames.load(Ordering::SeqCst), after_removal);

    h.orchestrator.stop();
}

#[test]
fn stop_is_idempotent_and_start_recovers() {
    let h = harness(monday(10, 0), TrustedDeviceSet::new(), Duration::from_secs(5));
    h.orchestrator.stop();
    assert!(!h.orchestrator.is_running());

    h.orchestrator.start().unwrap();
    assert!(wait_for(|| h.orchestrator.capture_launches() == 1));
    h.orchestrator.stop();
    h.orchestrator.stop();
    let status = h.orchestrator.status();
    assert!(!status.running);
    assert!(!status.capture_active);

    h.orchestrator.start().unwrap();
    assert!(h.orchestrator.is_running());
    assert!(wait_for(|| h.orchestrator.capture_launches() == 2));
    h.orchestrator.stop();
}

#[test]
fn settings_update_applies_on_next_tick() {
    let h = harness(monday(10, 0), TrustedDeviceSet::new(), Duration::from_secs(5));
    h.orchestrator.start().unwrap();
    assert!(wait_for(|| h.orchestrator.status().capture_active));

    let mut settings = (*h.orchestrator.settings()).clone();
    settings.schedule = ActivationSchedule::default()
        .with_window(Weekday::Mon, DayWindow::parse("18:00", "19:00").unwrap());
    h.orchestrator.update_settings(settings);

    assert!(wait_for(|| !h.orchestrator.is_activated()));
    assert!(wait_for(|| !h.orchestrator.status().capture_active));
    h.orchestrator.stop();
}

#[test]
fn analyzer_failure_ends_loop_and_cancels_evaluators_until_restart() {
    let h = harness_with(
        monday(10, 0),
        TrustedDeviceSet::new(),
        Duration::from_secs(5),
        Box::new(BrokenAnalyzer),
    );
    h.orchestrator.start().unwrap();

    assert!(wait_for(|| {
        h.orchestrator.capture_launches() == 1 && !h.orchestrator.status().capture_active
    }));
    thread::sleep(Duration::from_millis(50));
    let scans = h.network.scans.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(h.network.scans.load(Ordering::SeqCst), scans);
    assert!(h.orchestrator.is_running());
    assert_eq!(h.orchestrator.capture_launches(), 1);

    h.orchestrator.stop();
    h.orchestrator.start().unwrap();
    assert!(wait_for(|| h.orchestrator.capture_launches() == 2));
    assert!(wait_for(|| h.network.scans.load(Ordering::SeqCst) > scans));
    h.orchestrator.stop();
}
