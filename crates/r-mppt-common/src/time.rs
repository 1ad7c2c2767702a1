//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Shared primitives and utilities for the control runtime."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use std::time::Duration;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Convert a duration into milliseconds as a float, for rate-of-change checks.
pub fn duration_to_millis_f32(duration: Duration) -> f32 {
    (duration.as_secs_f64() * 1000.0) as f32
}

/// Convert a duration into fractional hours, for watt-hour integration.
pub fn duration_to_hours(duration: Duration) -> f64 {
    duration.as_secs_f64() / SECONDS_PER_HOUR
}

/// Convert a duration into whole milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Signed deviation of an observed interval from the expected one, in microseconds.
pub fn jitter_us(actual: Duration, expected: Duration) -> i64 {
    let actual_us = actual.as_secs_f64() * 1_000_000.0;
    let expected_us = expected.as_secs_f64() * 1_000_000.0;
    (actual_us - expected_us).round() as i64
}
