//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical acquisition channels. Panel and battery current may share one shunt
/// on the board; they stay distinct here so each keeps its own filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    PanelVoltage,
    PanelCurrent,
    BatteryVoltage,
    BatteryCurrent,
    Temperature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    Voltage,
    Current,
    Temperature,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::PanelVoltage,
        Channel::PanelCurrent,
        Channel::BatteryVoltage,
        Channel::BatteryCurrent,
        Channel::Temperature,
    ];

    pub fn class(&self) -> SignalClass {
        match self {
            Channel::PanelVoltage | Channel::BatteryVoltage => SignalClass::Voltage,
            Channel::PanelCurrent | Channel::BatteryCurrent => SignalClass::Current,
            Channel::Temperature => SignalClass::Temperature,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Channel::PanelVoltage => 0,
            Channel::PanelCurrent => 1,
            Channel::BatteryVoltage => 2,
            Channel::BatteryCurrent => 3,
            Channel::Temperature => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::PanelVoltage => "panel_voltage",
            Channel::PanelCurrent => "panel_current",
            Channel::BatteryVoltage => "battery_voltage",
            Channel::BatteryCurrent => "battery_current",
            Channel::Temperature => "temperature",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One acquisition of unconverted ADC counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawSample {
    pub panel_voltage: i16,
    pub panel_current: i16,
    pub battery_voltage: i16,
    pub battery_current: i16,
    /// 12-bit converter, unsigned.
    pub temperature: u16,
}

impl RawSample {
    /// Sample from a board where panel and battery current come off the same shunt.
    pub fn shared_shunt(panel_voltage: i16, current: i16, battery_voltage: i16, temperature: u16) -> Self {
        Self {
            panel_voltage,
            panel_current: current,
            battery_voltage,
            battery_current: current,
            temperature,
        }
    }

    pub fn get(&self, channel: Channel) -> i32 {
        match channel {
            Channel::PanelVoltage => i32::from(self.panel_voltage),
            Channel::PanelCurrent => i32::from(self.panel_current),
            Channel::BatteryVoltage => i32::from(self.battery_voltage),
            Channel::BatteryCurrent => i32::from(self.battery_current),
            Channel::Temperature => i32::from(self.temperature),
        }
    }
}

/// Filtered physical quantities plus derived power and efficiency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConditionedReading {
    pub panel_voltage: f32,
    pub panel_current: f32,
    pub panel_power: f32,
    pub battery_voltage: f32,
    /// Positive while charging.
    pub battery_current: f32,
    pub battery_power: f32,
    pub temperature: f32,
    /// Percent, within [0, 100].
    pub efficiency: f32,
}

impl Default for ConditionedReading {
    fn default() -> Self {
        Self {
            panel_voltage: 0.0,
            panel_current: 0.0,
            panel_power: 0.0,
            battery_voltage: 0.0,
            battery_current: 0.0,
            battery_power: 0.0,
            temperature: 25.0,
            efficiency: 0.0,
        }
    }
}

impl ConditionedReading {
    pub fn get(&self, channel: Channel) -> f32 {
        match channel {
            Channel::PanelVoltage => self.panel_voltage,
            Channel::PanelCurrent => self.panel_current,
            Channel::BatteryVoltage => self.battery_voltage,
            Channel::BatteryCurrent => self.battery_current,
            Channel::Temperature => self.temperature,
        }
    }

    pub fn set(&mut self, channel: Channel, value: f32) {
        match channel {
            Channel::PanelVoltage => self.panel_voltage = value,
            Channel::PanelCurrent => self.panel_current = value,
            Channel::BatteryVoltage => self.battery_voltage = value,
            Channel::BatteryCurrent => self.battery_current = value,
            Channel::Temperature => self.temperature = value,
        }
    }
}
