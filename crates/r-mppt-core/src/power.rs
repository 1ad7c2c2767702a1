//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use crate::reading::ConditionedReading;

/// Panel power below this is treated as no input when computing efficiency.
pub const POWER_EPSILON: f32 = 0.01;

/// Recompute power and conversion efficiency from the filtered V/I values.
pub fn update(reading: &mut ConditionedReading) {
    reading.panel_power = reading.panel_voltage * reading.panel_current;
    reading.battery_power = reading.battery_voltage * reading.battery_current;
    reading.efficiency = efficiency(reading.panel_power, reading.battery_power);
}

/// Battery side over panel side, in percent, clamped to [0, 100].
pub fn efficiency(panel_power: f32, battery_power: f32) -> f32 {
    if panel_power <= POWER_EPSILON || !battery_power.is_finite() {
        return 0.0;
    }
    (battery_power / panel_power * 100.0).clamp(0.0, 100.0)
}
