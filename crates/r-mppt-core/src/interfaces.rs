//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Seams between the control core and the outside world: sensor
//! acquisition, converter/relay outputs and daily statistics persistence.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SensorError;
use crate::reading::RawSample;
use crate::telemetry::DailyStats;

/// Blocking source of raw ADC samples.
pub trait SensorSource {
    fn read(&mut self) -> Result<RawSample, SensorError>;
}

impl<S: SensorSource + ?Sized> SensorSource for &mut S {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        (**self).read()
    }
}

impl<S: SensorSource + ?Sized> SensorSource for Box<S> {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        (**self).read()
    }
}

/// Converter and relay outputs written once per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    /// Fraction within [0, 1].
    pub duty: f32,
    pub pwm_counts: u16,
    pub panel_disconnect: bool,
    pub battery_disconnect: bool,
}

impl ActuatorCommand {
    /// Zero duty with both relays open.
    pub fn safe() -> Self {
        Self {
            duty: 0.0,
            pwm_counts: 0,
            panel_disconnect: true,
            battery_disconnect: true,
        }
    }

    /// Zero duty with both relays closed.
    pub fn idle() -> Self {
        Self {
            duty: 0.0,
            pwm_counts: 0,
            panel_disconnect: false,
            battery_disconnect: false,
        }
    }

    pub fn set_duty(&mut self, duty: f32, max_counts: u16) {
        let duty = if duty.is_finite() { duty.clamp(0.0, 1.0) } else { 0.0 };
        self.duty = duty;
        self.pwm_counts = (duty * f32::from(max_counts)).round() as u16;
    }

    pub fn cap_duty(&mut self, cap: f32, max_counts: u16) {
        if self.duty > cap {
            self.set_duty(cap, max_counts);
        }
    }
}

impl Default for ActuatorCommand {
    fn default() -> Self {
        Self::safe()
    }
}

pub trait Actuator {
    fn apply(&mut self, command: &ActuatorCommand);
}

impl<A: Actuator + ?Sized> Actuator for &mut A {
    fn apply(&mut self, command: &ActuatorCommand) {
        (**self).apply(command)
    }
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn apply(&mut self, command: &ActuatorCommand) {
        (**self).apply(command)
    }
}

/// Receives each finished day of statistics at the date rollover.
pub trait DailyStatsSink {
    fn persist(&mut self, stats: &DailyStats);
}

/// Sink that only logs the finished day.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatsSink;

impl DailyStatsSink for TracingStatsSink {
    fn persist(&mut self, stats: &DailyStats) {
        info!(
            date = %stats.date,
            max_power = stats.max_power,
            energy_wh = stats.total_energy_wh,
            avg_efficiency = stats.avg_efficiency,
            charge_cycles = stats.charge_cycles,
            min_battery_voltage = stats.min_battery_voltage,
            max_battery_voltage = stats.max_battery_voltage,
            "daily statistics"
        );
    }
}
