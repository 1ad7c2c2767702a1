//! ---
//! mppt_section: "11-simulation-test-harness"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Simulation runtime helpers and scenario engines."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use r_mppt_core::Clock;

const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone)]
enum Source {
    Realtime { origin: Instant, speedup: f64 },
    Stepped { elapsed: Duration },
}

/// Clock whose calendar date advances with simulated time, so accelerated
/// runs cross midnight and roll daily statistics over.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    source: Source,
    start_date: NaiveDate,
    start_offset: Duration,
}

impl SimulatedClock {
    /// Wall clock scaled by `speedup`.
    pub fn realtime(speedup: f64, start_date: NaiveDate, start_hour: f64) -> Self {
        Self {
            source: Source::Realtime {
                origin: Instant::now(),
                speedup: speedup.max(f64::EPSILON),
            },
            start_date,
            start_offset: hour_offset(start_hour),
        }
    }

    /// Clock that only moves through [`SimulatedClock::advance`].
    pub fn stepped(start_date: NaiveDate, start_hour: f64) -> Self {
        Self {
            source: Source::Stepped {
                elapsed: Duration::ZERO,
            },
            start_date,
            start_offset: hour_offset(start_hour),
        }
    }

    /// No effect on a realtime clock.
    pub fn advance(&mut self, step: Duration) {
        if let Source::Stepped { elapsed } = &mut self.source {
            *elapsed += step;
        }
    }
}

fn hour_offset(hour: f64) -> Duration {
    Duration::from_secs_f64((hour.clamp(0.0, 23.999) * 3600.0).max(0.0))
}

impl Clock for SimulatedClock {
    fn monotonic(&self) -> Duration {
        match &self.source {
            Source::Realtime { origin, speedup } => origin.elapsed().mul_f64(*speedup),
            Source::Stepped { elapsed } => *elapsed,
        }
    }

    fn today(&self) -> NaiveDate {
        let days = (self.start_offset + self.monotonic()).as_secs() / SECONDS_PER_DAY;
        self.start_date
            .checked_add_days(Days::new(days))
            .unwrap_or(NaiveDate::MAX)
    }
}
