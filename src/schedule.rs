//! Weekly activation schedule.
//!
//! One optional window per weekday (index 0 = Monday). A day without a window
//! is active all day, and so is a day whose window starts and ends at the same
//! instant. Otherwise the window bounds are inclusive.

use anyhow::{anyhow, bail, Result};
use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

pub const TIME_FORMAT: &str = "%H:%M";
pub const DAYS_PER_WEEK: usize = 7;

/// Inclusive time-of-day range for one weekday.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DayWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl DayWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self> {
        if start > end {
            bail!(
                "activation window start {} is after end {}",
                start.format(TIME_FORMAT),
                end.format(TIME_FORMAT)
            );
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Self::new(parse_time(start)?, parse_time(end)?)
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    /// A degenerate window (start == end) covers the whole day.
    pub fn is_full_day(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        self.is_full_day() || (self.start <= time && time <= self.end)
    }
}

/// Serialized form of one window: `[day, "HH:MM", "HH:MM"]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodEntry(pub u8, pub String, pub String);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActivationSchedule {
    days: [Option<DayWindow>; DAYS_PER_WEEK],
}

impl ActivationSchedule {
    /// Schedule with no windows: always active.
    pub fn always() -> Self {
        Self::default()
    }

    pub fn with_window(mut self, day: Weekday, window: DayWindow) -> Self {
        self.set_window(day, Some(window));
        self
    }

    pub fn set_window(&mut self, day: Weekday, window: Option<DayWindow>) {
        self.days[day.num_days_from_monday() as usize] = window;
    }

    pub fn window(&self, day: Weekday) -> Option<DayWindow> {
        self.days[day.num_days_from_monday() as usize]
    }

    pub fn is_activated(&self, now: NaiveDateTime) -> bool {
        match self.window(now.weekday()) {
            Some(window) => window.contains(now.time()),
            None => true,
        }
    }

    /// Build from serialized entries. Rejects bad days, bad times, inverted
    /// windows and a second window for the same day.
    pub fn from_entries(entries: &[PeriodEntry]) -> Result<Self> {
        let mut schedule = Self::default();
        for PeriodEntry(day, start, end) in entries {
            let index = usize::from(*day);
            if index >= DAYS_PER_WEEK {
                bail!("invalid day {} in activation periods (expected 0..=6)", day);
            }
            if schedule.days[index].is_some() {
                bail!("duplicate activation window for day {}", day);
            }
            schedule.days[index] = Some(DayWindow::parse(start, end)?);
        }
        Ok(schedule)
    }

    pub fn to_entries(&self) -> Vec<PeriodEntry> {
        self.days
            .iter()
            .enumerate()
            .filter_map(|(day, window)| {
                window.map(|w| {
                    PeriodEntry(
                        day as u8,
                        w.start.format(TIME_FORMAT).to_string(),
                        w.end.format(TIME_FORMAT).to_string(),
                    )
                })
            })
            .collect()
    }
}

/// Is `now` inside the schedule's activation window for its weekday?
pub fn is_activated(now: NaiveDateTime, schedule: &ActivationSchedule) -> bool {
    schedule.is_activated(now)
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), TIME_FORMAT)
        .map_err(|e| anyhow!("invalid time '{}' (expected HH:MM): {}", value, e))
}
