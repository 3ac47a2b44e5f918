//! Clock and timer service.
//!
//! - `Clock`: monotonic instants for elapsed-time logic, local wall time for
//!   schedule evaluation.
//! - `ManualClock`: deterministic clock for tests.
//! - `PeriodicTask`: a named background thread firing a callback once
//!   immediately and then on a fixed period until cancelled.

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDateTime};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::log::Logger;

pub trait Clock: Send + Sync {
    /// Monotonic time, used for debounce, flush and throttling windows.
    fn now(&self) -> Instant;

    /// Local wall-clock time, used for activation windows.
    fn local(&self) -> NaiveDateTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Test clock. Monotonic and wall time only move when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    offset: Duration,
    local: NaiveDateTime,
}

impl ManualClock {
    pub fn new(local: NaiveDateTime) -> Self {
        Self {
            base: Instant::now(),
            state: Mutex::new(ManualState {
                offset: Duration::ZERO,
                local,
            }),
        }
    }

    /// Advance both the monotonic and the wall clock.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.offset += by;
        if let Ok(delta) = chrono::Duration::from_std(by) {
            state.local += delta;
        }
    }

    /// Jump the wall clock without touching monotonic time.
    pub fn set_local(&self, local: NaiveDateTime) {
        self.lock().local = local;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.lock().offset
    }

    fn local(&self) -> NaiveDateTime {
        self.lock().local
    }
}

// ----------------------------------------------------------------------------
// PeriodicTask
// ----------------------------------------------------------------------------

/// Cancellable periodic background task.
///
/// Cancellation drops the wake-up channel, so a sleeping task exits at once and
/// never fires again. A callback already in flight runs to completion.
pub struct PeriodicTask {
    name: String,
    cancel: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &str, period: Duration, log: &Logger, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(anyhow!("period of task '{}' must be greater than zero", name));
        }
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let log = log.clone();
        let task_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    tick();
                    match cancel_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!(target: log.target(), "{} task cancelled", task_name);
            })
            .map_err(|e| anyhow!("failed to spawn task '{}': {}", name, e))?;
        Ok(Self {
            name: name.to_string(),
            cancel: Mutex::new(Some(cancel_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the next scheduled fire. Idempotent, callable from any thread.
    pub fn cancel(&self) {
        let sender = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    /// Cancel and wait for the task thread to exit.
    ///
    /// Must not be called from inside the task's own callback.
    pub fn join(&self) -> Result<()> {
        self.cancel();
        let handle = self
            .handle
            .lock()
            .map_err(|_| anyhow!("task '{}' handle lock poisoned", self.name))?
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow!("task '{}' panicked", self.name))?;
        }
        Ok(())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Shared list of cancellable tasks, so a failing component can cancel its
/// siblings without going through the owner's lifecycle lock.
#[derive(Clone, Default)]
pub struct TaskSet {
    tasks: Arc<Mutex<Vec<PeriodicTask>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: PeriodicTask) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    /// Cancel and drop every task. Returns the number cancelled.
    pub fn cancel_all(&self) -> usize {
        let tasks: Vec<PeriodicTask> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in &tasks {
            task.cancel();
        }
        tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .map(|guard| guard.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
