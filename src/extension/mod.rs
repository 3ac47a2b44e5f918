//! Notification extensions.
//!
//! Each extension sits behind its own `ExtensionHandle`, which owns the
//! extension, its throttling state and its pending buffer under a lock that is
//! private to that extension. The `Dispatcher` fans a flushed batch out to all
//! handles concurrently, so a slow transport only stalls itself.
//!
//! Throttling: a submit is delivered when it is the first one, when the
//! triggering interval is zero or negative, or when at least the interval has
//! elapsed since the last attempt. Otherwise the batch is parked in the pending
//! buffer and merged into the next delivered submit.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::capture::{EventBatch, MotionEvent};
use crate::clock::Clock;
use crate::log::Logger;

pub mod smtp;
pub mod upload;

pub use smtp::{MailMessage, MailTransport, SmtpNotifier, SpoolMailTransport};
pub use upload::{FileSink, FtpUploader, SpoolSink};

pub const DEFAULT_PENDING_CAPACITY: usize = 50;

/// Per-extension settings. Keys without a dedicated field (`from`, `to`, ...)
/// land in `extra`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub enabled: bool,
    /// Minimum seconds between two delivery attempts. Zero or negative
    /// disables throttling.
    #[serde(alias = "triggering_interval")]
    pub triggering_interval_secs: i64,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            triggering_interval_secs: -1,
            server: None,
            port: None,
            user: None,
            password: None,
            extra: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for ExtensionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionConfig")
            .field("enabled", &self.enabled)
            .field("triggering_interval_secs", &self.triggering_interval_secs)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("extra", &self.extra)
            .finish()
    }
}

impl ExtensionConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Extension-specific key, empty values treated as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Server and port, when both are configured.
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        let server = self.server.as_deref().filter(|s| !s.trim().is_empty())?;
        let port = self.port.filter(|port| *port > 0)?;
        Some((server, port))
    }

    fn interval(&self) -> Option<Duration> {
        (self.triggering_interval_secs > 0)
            .then(|| Duration::from_secs(self.triggering_interval_secs as u64))
    }
}

/// A notification transport.
pub trait Extension: Send {
    /// Stable type name, also the key in the `extensions` config section.
    fn kind(&self) -> &'static str;

    /// Deliver a merged batch. Errors are reported as "not delivered"; the
    /// batch is not re-queued.
    fn deliver(&mut self, events: &[MotionEvent], message: &str, config: &ExtensionConfig) -> Result<()>;
}

/// Result of one submit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    Disabled,
    /// Delivery attempted and succeeded with this many events.
    Delivered { events: usize },
    /// Throttled; the batch waits in the pending buffer.
    Deferred { pending: usize },
    /// Delivery attempted and failed.
    Failed,
}

impl Submission {
    pub fn delivered(&self) -> bool {
        matches!(self, Submission::Delivered { .. })
    }
}

struct ThrottleState {
    extension: Box<dyn Extension>,
    last_delivery: Option<Instant>,
    pending: EventBatch,
}

pub struct ExtensionHandle {
    name: &'static str,
    state: Mutex<ThrottleState>,
    config: RwLock<ExtensionConfig>,
    clock: Arc<dyn Clock>,
    log: Logger,
}

impl ExtensionHandle {
    pub fn new(
        extension: Box<dyn Extension>,
        config: ExtensionConfig,
        clock: Arc<dyn Clock>,
        log: &Logger,
    ) -> Self {
        let name = extension.kind();
        Self {
            name,
            state: Mutex::new(ThrottleState {
                extension,
                last_delivery: None,
                pending: EventBatch::new(DEFAULT_PENDING_CAPACITY),
            }),
            config: RwLock::new(config),
            clock,
            log: log.child(name),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config(&self) -> ExtensionConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_config(&self, config: ExtensionConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    pub fn last_delivery(&self) -> Option<Instant> {
        self.lock_state().last_delivery
    }

    pub fn pending(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Submit a batch, delivering it (plus anything pending) if the throttle
    /// admits, or parking it otherwise.
    pub fn submit(&self, events: &[MotionEvent], message: &str) -> Submission {
        let config = self.config();
        if !config.enabled {
            log::debug!(target: self.log.target(), "disabled, ignoring {} event(s)", events.len());
            return Submission::Disabled;
        }

        let mut state = self.lock_state();
        let now = self.clock.now();
        let due = match (state.last_delivery, config.interval()) {
            (None, _) | (_, None) => true,
            (Some(last), Some(interval)) => now.saturating_duration_since(last) >= interval,
        };

        if !due {
            let dropped = state.pending.extend(events.iter().cloned());
            if dropped > 0 {
                log::warn!(
                    target: self.log.target(),
                    "pending buffer full, dropped {} oldest event(s)",
                    dropped
                );
            }
            log::debug!(
                target: self.log.target(),
                "triggering interval not reached, {} event(s) pending",
                state.pending.len()
            );
            return Submission::Deferred {
                pending: state.pending.len(),
            };
        }

        let mut merged = state.pending.take();
        merged.extend(events.iter().cloned());
        state.last_delivery = Some(state.last_delivery.map_or(now, |last| last.max(now)));

        match state.extension.deliver(&merged, message, &config) {
            Ok(()) => {
                log::info!(target: self.log.target(), "delivered {} event(s)", merged.len());
                Submission::Delivered {
                    events: merged.len(),
                }
            }
            Err(e) => {
                log::warn!(
                    target: self.log.target(),
                    "delivery of {} event(s) failed: {:#}",
                    merged.len(),
                    e
                );
                Submission::Failed
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ThrottleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ExtensionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Outcome of one dispatch, per extension in registration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcomes: Vec<(&'static str, Submission)>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.delivered())
            .count()
    }

    pub fn outcome(&self, name: &str) -> Option<Submission> {
        self.outcomes
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, outcome)| *outcome)
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    extensions: Vec<Arc<ExtensionHandle>>,
    log: Logger,
}

impl Dispatcher {
    pub fn new(log: Logger) -> Self {
        Self {
            extensions: Vec::new(),
            log,
        }
    }

    pub fn register(&mut self, handle: ExtensionHandle) -> Arc<ExtensionHandle> {
        let handle = Arc::new(handle);
        self.extensions.push(handle.clone());
        handle
    }

    pub fn extension(&self, name: &str) -> Option<&Arc<ExtensionHandle>> {
        self.extensions.iter().find(|handle| handle.name() == name)
    }

    pub fn extensions(&self) -> &[Arc<ExtensionHandle>] {
        &self.extensions
    }

    /// Submit the batch to every extension concurrently and wait for all.
    pub fn dispatch(&self, events: &[MotionEvent], message: &str) -> DispatchReport {
        if events.is_empty() || self.extensions.is_empty() {
            return DispatchReport::default();
        }
        let outcomes = thread::scope(|scope| {
            let workers: Vec<_> = self
                .extensions
                .iter()
                .map(|handle| (handle.name(), scope.spawn(move || handle.submit(events, message))))
                .collect();
            workers
                .into_iter()
                .map(|(name, worker)| {
                    let outcome = worker.join().unwrap_or_else(|_| {
                        log::error!(target: self.log.target(), "extension {} panicked", name);
                        Submission::Failed
                    });
                    (name, outcome)
                })
                .collect()
        });
        let report = DispatchReport { outcomes };
        log::debug!(
            target: self.log.target(),
            "dispatched {} event(s): {:?}",
            events.len(),
            report.outcomes
        );
        report
    }
}
