//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Perturb & observe maximum power point tracker.
//!
//! A coarse sweep of the whole duty range finds the neighbourhood of the
//! peak first. Fine tracking then moves the converter duty cycle by a fixed
//! step and keeps the direction while panel power increases, reversing it
//! when power drops. Once the power stops changing the duty cycle is held
//! until the operating point drifts. Low panel power slows the perturbation
//! rate down and only reverses on drops larger than the low-power hysteresis.

use std::fmt;

use r_mppt_common::TrackerConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MpptState {
    Scanning,
    Tracking,
    Holding,
    LowPower,
}

impl MpptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MpptState::Scanning => "scanning",
            MpptState::Tracking => "tracking",
            MpptState::Holding => "holding",
            MpptState::LowPower => "low_power",
        }
    }
}

impl fmt::Display for MpptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one observation while sweeping the duty range.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ScanProgress {
    best_power: f32,
    past_peak: u32,
    /// Next sweep position, `None` once the sweep is over.
    next_duty: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct MpptTracker {
    config: TrackerConfig,
    state: MpptState,
    duty: f32,
    direction: f32,
    previous_power: Option<f32>,
    best_power: f32,
    best_duty: f32,
    past_peak: u32,
    sweep_start: f32,
    sweep_steps: u32,
    wrapped: bool,
    quiet_count: u32,
    hold_power: f32,
    interval_ticks: u32,
    low_power_ticks: u32,
    low_power_reference: Option<f32>,
}

impl MpptTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            config: config.clone(),
            state: MpptState::Scanning,
            duty: config.initial_duty,
            direction: 1.0,
            previous_power: None,
            best_power: 0.0,
            best_duty: config.initial_duty,
            past_peak: 0,
            sweep_start: config.initial_duty,
            sweep_steps: 0,
            wrapped: false,
            quiet_count: 0,
            hold_power: 0.0,
            interval_ticks: 0,
            low_power_ticks: 0,
            low_power_reference: None,
        }
    }

    pub fn state(&self) -> MpptState {
        self.state
    }

    pub fn duty(&self) -> f32 {
        self.duty
    }

    /// Back to a fresh scan from the initial duty cycle.
    pub fn reset(&mut self) {
        *self = Self::new(&self.config);
        debug!("mppt tracker reset");
    }

    /// Adopt the duty cycle actually applied after downstream clamping, so the
    /// next perturbation starts from the real operating point.
    pub fn constrain(&mut self, applied: f32) {
        self.duty = self.clamp(applied);
    }

    /// Where the tracker goes next when `power` is observed at the current duty.
    pub fn next_state(&self, power: f32) -> MpptState {
        let cfg = &self.config;
        match self.state {
            MpptState::Scanning => {
                let progress = self.scan_progress(power);
                match progress.next_duty {
                    Some(_) => MpptState::Scanning,
                    None if progress.best_power >= cfg.low_power_threshold => MpptState::Tracking,
                    None => MpptState::LowPower,
                }
            }
            MpptState::LowPower => {
                if power >= cfg.low_power_threshold + cfg.low_power_hysteresis {
                    MpptState::Scanning
                } else {
                    MpptState::LowPower
                }
            }
            _ if power < cfg.low_power_threshold => MpptState::LowPower,
            MpptState::Tracking => {
                let quiet = self
                    .previous_power
                    .is_some_and(|previous| (power - previous).abs() <= cfg.noise_threshold);
                if quiet && self.quiet_count + 1 >= cfg.hold_cycles {
                    MpptState::Holding
                } else {
                    MpptState::Tracking
                }
            }
            MpptState::Holding => {
                if (power - self.hold_power).abs() > cfg.retrack_threshold {
                    MpptState::Tracking
                } else {
                    MpptState::Holding
                }
            }
        }
    }

    /// Feed the latest panel power and return the proposed duty cycle, always
    /// within the configured bounds. The filtered power needs time to settle
    /// after a duty change, so only every `perturb_interval`-th call observes
    /// it; the calls in between keep the duty cycle where it is.
    pub fn update(&mut self, power: f32) -> f32 {
        self.interval_ticks += 1;
        if self.interval_ticks < self.config.perturb_interval {
            return self.duty;
        }
        self.interval_ticks = 0;
        self.observe(power)
    }

    fn observe(&mut self, power: f32) -> f32 {
        let next = self.next_state(power);
        let delta = self.previous_power.map(|previous| power - previous);
        self.previous_power = Some(power);

        if next != self.state {
            info!(from = %self.state, to = %next, power, duty = self.duty, "mppt state change");
        }

        let step = self.config.step_size;
        let coarse = step * self.config.scan_step_multiplier;
        match (self.state, next) {
            (MpptState::Scanning, _) => {
                let progress = self.scan_progress(power);
                if progress.best_power > self.best_power {
                    self.best_duty = self.duty;
                }
                self.best_power = progress.best_power;
                self.past_peak = progress.past_peak;
                match (next, progress.next_duty) {
                    (MpptState::Scanning, Some(duty)) => {
                        if duty < self.duty {
                            self.wrapped = true;
                        }
                        self.duty = duty;
                        self.sweep_steps += 1;
                    }
                    (MpptState::Tracking, _) => {
                        debug!(best_power = self.best_power, best_duty = self.best_duty, "sweep finished");
                        self.duty = self.best_duty;
                        self.direction = 1.0;
                        self.quiet_count = 0;
                        // The jump to the best point invalidates the last observation.
                        self.previous_power = None;
                    }
                    _ => self.enter_low_power(power),
                }
            }
            (_, MpptState::LowPower) if self.state != MpptState::LowPower => {
                self.enter_low_power(power);
            }
            (MpptState::LowPower, MpptState::LowPower) => {
                self.low_power_ticks += 1;
                if self.low_power_ticks % self.config.low_power_divider == 0 {
                    let reference_delta = self.low_power_reference.map(|reference| power - reference);
                    self.low_power_reference = Some(power);
                    self.perturb(reference_delta, coarse, self.config.low_power_hysteresis);
                }
            }
            (MpptState::LowPower, MpptState::Scanning) => self.begin_sweep(power),
            (MpptState::Tracking, MpptState::Tracking) => {
                if delta.is_some_and(|d| d.abs() <= self.config.noise_threshold) {
                    self.quiet_count += 1;
                } else {
                    self.quiet_count = 0;
                }
                self.perturb(delta, step, 0.0);
            }
            (MpptState::Tracking, MpptState::Holding) => {
                self.hold_power = power;
            }
            (MpptState::Holding, MpptState::Tracking) => {
                self.quiet_count = 0;
                self.perturb(delta, step, 0.0);
            }
            _ => {}
        }

        self.state = next;
        self.duty
    }

    /// Sweep bookkeeping for `power` observed at the current duty. The sweep
    /// climbs in coarse steps to the upper bound, wraps around to cover the
    /// range below its start and ends early once power has fallen past a
    /// usable peak for `scan_settle_cycles` observations. A duty held down
    /// downstream cannot stretch it past one pass over the range.
    fn scan_progress(&self, power: f32) -> ScanProgress {
        let cfg = &self.config;
        let coarse = cfg.step_size * cfg.scan_step_multiplier;
        let max_steps = ((cfg.max_duty - cfg.min_duty) / coarse).ceil() as u32 + 2;
        let best_power = self.best_power.max(power);
        let past_peak = if best_power >= cfg.low_power_threshold
            && power < best_power * (1.0 - cfg.scan_tolerance)
        {
            self.past_peak + 1
        } else {
            0
        };
        let next_duty = if past_peak >= cfg.scan_settle_cycles || self.sweep_steps >= max_steps {
            None
        } else if self.duty >= cfg.max_duty {
            (!self.wrapped && self.sweep_start > cfg.min_duty).then_some(cfg.min_duty)
        } else {
            let next = self.clamp(self.duty + coarse);
            (!(self.wrapped && next >= self.sweep_start)).then_some(next)
        };
        ScanProgress {
            best_power,
            past_peak,
            next_duty,
        }
    }

    fn begin_sweep(&mut self, power: f32) {
        self.sweep_start = self.duty;
        self.sweep_steps = 0;
        self.wrapped = false;
        self.best_power = power;
        self.best_duty = self.duty;
        self.past_peak = 0;
        self.direction = 1.0;
    }

    fn enter_low_power(&mut self, power: f32) {
        self.low_power_ticks = 0;
        self.low_power_reference = Some(power);
    }

    /// Step the duty cycle, reversing direction when power fell by more than
    /// `gate` or the step ran into a bound.
    fn perturb(&mut self, delta: Option<f32>, step: f32, gate: f32) {
        if delta.is_some_and(|d| d < -gate) {
            self.direction = -self.direction;
        }
        let target = self.duty + self.direction * step;
        let clamped = self.clamp(target);
        if clamped != target {
            self.direction = -self.direction;
        }
        self.duty = clamped;
    }

    fn clamp(&self, duty: f32) -> f32 {
        duty.clamp(self.config.min_duty, self.config.max_duty)
    }
}
