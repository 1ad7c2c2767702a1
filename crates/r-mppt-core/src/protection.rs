//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Protection supervisor.
//!
//! Evaluated every cycle on the conditioned reading. Each condition has its
//! own hysteresis latch so a reading that oscillates around a threshold does
//! not toggle the outcome. The decision is applied to the actuator command
//! after every other component has written it, so protection always has the
//! last word.
//!
//! | level     | outputs                                 | leaves when                          |
//! |-----------|-----------------------------------------|--------------------------------------|
//! | Normal    | untouched                               |                                      |
//! | Warning   | duty capped                             | every warning latch clears           |
//! | Fault     | duty 0, battery relay open              | latches clear and cool-down elapses  |
//! | Emergency | duty 0, panel and battery relays open   | explicit fault clear only            |

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use r_mppt_common::time::duration_to_millis_f32;
use r_mppt_common::ProtectionConfig;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::interfaces::ActuatorCommand;
use crate::reading::ConditionedReading;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionState {
    #[default]
    Normal,
    Warning,
    Fault,
    Emergency,
}

impl ProtectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionState::Normal => "normal",
            ProtectionState::Warning => "warning",
            ProtectionState::Fault => "fault",
            ProtectionState::Emergency => "emergency",
        }
    }
}

impl fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Active protection conditions, one bit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorFlags(u8);

impl ErrorFlags {
    pub const OVER_VOLTAGE: Self = Self(1 << 0);
    pub const UNDER_VOLTAGE: Self = Self(1 << 1);
    pub const OVER_TEMPERATURE: Self = Self(1 << 2);
    pub const SHORT_CIRCUIT: Self = Self(1 << 3);
    pub const OVER_CURRENT: Self = Self(1 << 4);
    pub const CURRENT_RISE: Self = Self(1 << 5);
    pub const SENSOR: Self = Self(1 << 6);
    pub const PANEL_OVER_VOLTAGE: Self = Self(1 << 7);

    const NAMES: [(ErrorFlags, &'static str); 8] = [
        (Self::OVER_VOLTAGE, "over_voltage"),
        (Self::UNDER_VOLTAGE, "under_voltage"),
        (Self::OVER_TEMPERATURE, "over_temperature"),
        (Self::SHORT_CIRCUIT, "short_circuit"),
        (Self::OVER_CURRENT, "over_current"),
        (Self::CURRENT_RISE, "current_rise"),
        (Self::SENSOR, "sensor"),
        (Self::PANEL_OVER_VOLTAGE, "panel_over_voltage"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, active: bool) {
        if active {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for ErrorFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Outcome of the last acquisition, as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorStatus {
    Fresh,
    /// Nothing usable arrived; the reading holds the previous values.
    Missing,
    /// A converter is pinned at its rail.
    OutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProtectionAction {
    None,
    CapDuty(f32),
    Shutdown {
        panel_disconnect: bool,
        battery_disconnect: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectionDecision {
    pub state: ProtectionState,
    pub flags: ErrorFlags,
    pub action: ProtectionAction,
}

impl ProtectionDecision {
    /// Override the command. Runs after every other writer of the command.
    pub fn apply(&self, command: &mut ActuatorCommand, max_counts: u16) {
        match self.action {
            ProtectionAction::None => {}
            ProtectionAction::CapDuty(cap) => command.cap_duty(cap, max_counts),
            ProtectionAction::Shutdown {
                panel_disconnect,
                battery_disconnect,
            } => {
                command.set_duty(0.0, max_counts);
                command.panel_disconnect |= panel_disconnect;
                command.battery_disconnect |= battery_disconnect;
            }
        }
    }
}

/// Set/clear latch with separate enter and exit conditions.
#[derive(Debug, Clone, Copy, Default)]
struct Latch {
    active: bool,
}

impl Latch {
    fn update(&mut self, enter: bool, exit: bool) -> bool {
        if self.active {
            if exit {
                self.active = false;
            }
        } else if enter {
            self.active = true;
        }
        self.active
    }
}

#[derive(Debug, Clone, Default)]
struct Latches {
    critical_low: Latch,
    low_voltage: Latch,
    short_circuit: Latch,
    over_temperature: Latch,
    temperature_warning: Latch,
    over_current: Latch,
    discharge_current: Latch,
    panel_over_voltage: Latch,
}

#[derive(Debug, Clone, Copy)]
struct CurrentSample {
    at: Duration,
    panel: f32,
    battery: f32,
}

#[derive(Debug, Clone)]
pub struct ProtectionSupervisor {
    limits: ProtectionConfig,
    sensor_fault_cycles: u32,
    state: ProtectionState,
    flags: ErrorFlags,
    emergency: bool,
    latches: Latches,
    sensor_failures: u32,
    last_current: Option<CurrentSample>,
    last_fault_at: Option<Duration>,
}

impl ProtectionSupervisor {
    pub fn new(limits: &ProtectionConfig, sensor_fault_cycles: u32) -> Self {
        Self {
            limits: limits.clone(),
            sensor_fault_cycles: sensor_fault_cycles.max(1),
            state: ProtectionState::Normal,
            flags: ErrorFlags::empty(),
            emergency: false,
            latches: Latches::default(),
            sensor_failures: 0,
            last_current: None,
            last_fault_at: None,
        }
    }

    pub fn state(&self) -> ProtectionState {
        self.state
    }

    pub fn flags(&self) -> ErrorFlags {
        self.flags
    }

    pub fn limits(&self) -> &ProtectionConfig {
        &self.limits
    }

    pub fn set_limits(&mut self, limits: &ProtectionConfig) {
        self.limits = limits.clone();
    }

    /// Release a latched emergency and drop any remaining fault cool-down.
    /// Conditions still present re-trip on the next evaluation.
    pub fn clear_fault(&mut self) {
        if self.emergency || self.last_fault_at.is_some() {
            info!(state = %self.state, "protection fault cleared");
        }
        self.emergency = false;
        self.last_fault_at = None;
    }

    pub fn evaluate(
        &mut self,
        reading: &ConditionedReading,
        sensor: SensorStatus,
        now: Duration,
    ) -> ProtectionDecision {
        let l = &self.limits;
        let mut flags = ErrorFlags::empty();

        match sensor {
            SensorStatus::Fresh => self.sensor_failures = 0,
            SensorStatus::Missing => self.sensor_failures = self.sensor_failures.saturating_add(1),
            SensorStatus::OutOfRange => {
                self.sensor_failures = self.sensor_failures.max(self.sensor_fault_cycles)
            }
        }
        let sensor_degraded = self.sensor_failures > 0;
        let sensor_fault = self.sensor_failures >= self.sensor_fault_cycles;
        flags.set(ErrorFlags::SENSOR, sensor_degraded);

        let v = reading.battery_voltage;
        if v > l.battery_voltage_critical_high && !self.emergency {
            error!(battery_voltage = v, "battery over-voltage emergency");
            self.emergency = true;
        }
        flags.set(ErrorFlags::OVER_VOLTAGE, self.emergency);

        let vh = l.battery_voltage_hysteresis;
        let ch = l.current_hysteresis;
        let th = l.temperature_hysteresis;
        let (pc, bc, t, pv) = (
            reading.panel_current,
            reading.battery_current,
            reading.temperature,
            reading.panel_voltage,
        );
        let latches = &mut self.latches;

        let critical_low = latches.critical_low.update(
            v < l.battery_voltage_critical_low,
            v > l.battery_voltage_critical_low + vh,
        );
        let low_voltage = latches
            .low_voltage
            .update(v < l.battery_voltage_low, v > l.battery_voltage_low + vh);
        let short_circuit = latches.short_circuit.update(
            pc > l.short_circuit_threshold || bc > l.short_circuit_threshold,
            pc < l.short_circuit_threshold - ch && bc < l.short_circuit_threshold - ch,
        );
        let over_temperature = latches
            .over_temperature
            .update(t > l.temperature_max, t < l.temperature_max - th);
        let temperature_warning = latches
            .temperature_warning
            .update(t > l.temperature_warning, t < l.temperature_warning - th);
        let over_current = latches
            .over_current
            .update(bc > l.max_charge_current, bc < l.max_charge_current - ch);
        let discharge_current = latches
            .discharge_current
            .update(-bc > l.max_discharge_current, -bc < l.max_discharge_current - ch);
        let panel_over_voltage = latches
            .panel_over_voltage
            .update(pv > l.panel_voltage_max, pv < l.panel_voltage_max - vh);

        let current_rise = match sensor {
            SensorStatus::Fresh => self.current_rise(pc, bc, now),
            _ => false,
        };

        flags.set(ErrorFlags::UNDER_VOLTAGE, critical_low || low_voltage);
        flags.set(ErrorFlags::SHORT_CIRCUIT, short_circuit);
        flags.set(ErrorFlags::OVER_TEMPERATURE, over_temperature || temperature_warning);
        flags.set(ErrorFlags::OVER_CURRENT, over_current || discharge_current);
        flags.set(ErrorFlags::CURRENT_RISE, current_rise);
        flags.set(ErrorFlags::PANEL_OVER_VOLTAGE, panel_over_voltage);

        let fault_now = critical_low
            || short_circuit
            || over_temperature
            || panel_over_voltage
            || current_rise
            || sensor_fault;
        if fault_now {
            self.last_fault_at = Some(now);
        }
        let cooling_down = self
            .last_fault_at
            .is_some_and(|at| now.saturating_sub(at) < self.limits.fault_cooldown);
        let warning = low_voltage
            || temperature_warning
            || over_current
            || discharge_current
            || sensor_degraded;

        let state = if self.emergency {
            ProtectionState::Emergency
        } else if fault_now || cooling_down {
            ProtectionState::Fault
        } else if warning {
            ProtectionState::Warning
        } else {
            ProtectionState::Normal
        };
        if !fault_now && !cooling_down {
            self.last_fault_at = None;
        }

        if state != self.state || flags != self.flags {
            match state {
                ProtectionState::Normal => info!(from = %self.state, "protection normal"),
                ProtectionState::Warning => {
                    warn!(from = %self.state, flags = %flags, "protection warning")
                }
                _ => error!(from = %self.state, to = %state, flags = %flags, "protection trip"),
            }
        }
        self.state = state;
        self.flags = flags;

        let action = match state {
            ProtectionState::Normal => ProtectionAction::None,
            ProtectionState::Warning => ProtectionAction::CapDuty(self.limits.warning_duty_cap),
            ProtectionState::Fault => ProtectionAction::Shutdown {
                panel_disconnect: false,
                battery_disconnect: true,
            },
            ProtectionState::Emergency => ProtectionAction::Shutdown {
                panel_disconnect: true,
                battery_disconnect: true,
            },
        };
        ProtectionDecision {
            state,
            flags,
            action,
        }
    }

    /// Compare against the previous fresh sample; a zero interval is skipped.
    fn current_rise(&mut self, panel: f32, battery: f32, now: Duration) -> bool {
        let previous = self.last_current.replace(CurrentSample {
            at: now,
            panel,
            battery,
        });
        let Some(previous) = previous else {
            return false;
        };
        let elapsed_ms = duration_to_millis_f32(now.saturating_sub(previous.at));
        if elapsed_ms <= 0.0 {
            return false;
        }
        let rise = (panel - previous.panel)
            .abs()
            .max((battery - previous.battery).abs());
        rise / elapsed_ms > self.limits.max_current_rise_rate
    }
}
