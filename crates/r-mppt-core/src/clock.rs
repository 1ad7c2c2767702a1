//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};

/// Monotonic time for the control loop plus the calendar date for statistics.
pub trait Clock {
    fn monotonic(&self) -> Duration;
    fn today(&self) -> NaiveDate;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn monotonic(&self) -> Duration {
        (**self).monotonic()
    }

    fn today(&self) -> NaiveDate {
        (**self).today()
    }
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Hand-stepped clock for tests and offline replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    elapsed: Duration,
    date: NaiveDate,
}

impl ManualClock {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            elapsed: Duration::ZERO,
            date,
        }
    }

    pub fn advance(&mut self, step: Duration) {
        self.elapsed += step;
    }

    pub fn set_date(&mut self, date: NaiveDate) {
        self.date = date;
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.elapsed
    }

    fn today(&self) -> NaiveDate {
        self.date
    }
}
