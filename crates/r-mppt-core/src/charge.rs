//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Multi-stage charge sequencing and the voltage/current ceiling clamp.
//!
//! ```text
//!  Off --> Bulk --> Absorption --> Float --> Maintenance
//!   ^                                |  \        |
//!   |                                |   Equalization
//!   +------------ rebulk ------------+-----------+
//! ```

use std::fmt;
use std::time::Duration;

use r_mppt_common::ChargeConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::profile::BatteryProfile;
use crate::protection::ProtectionState;
use crate::reading::ConditionedReading;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ChargePhase {
    #[default]
    Off,
    Bulk,
    Absorption,
    Float,
    Equalization,
    Maintenance,
}

impl ChargePhase {
    pub const ALL: [ChargePhase; 6] = [
        ChargePhase::Off,
        ChargePhase::Bulk,
        ChargePhase::Absorption,
        ChargePhase::Float,
        ChargePhase::Equalization,
        ChargePhase::Maintenance,
    ];

    pub fn code(&self) -> u8 {
        match self {
            ChargePhase::Off => 0,
            ChargePhase::Bulk => 1,
            ChargePhase::Absorption => 2,
            ChargePhase::Float => 3,
            ChargePhase::Equalization => 4,
            ChargePhase::Maintenance => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|phase| phase.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChargePhase::Off => "off",
            ChargePhase::Bulk => "bulk",
            ChargePhase::Absorption => "absorption",
            ChargePhase::Float => "float",
            ChargePhase::Equalization => "equalization",
            ChargePhase::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for ChargePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ceilings the converter output must respect in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeTarget {
    pub voltage_ceiling: f32,
    pub current_ceiling: f32,
}

/// Which loop is in control of the duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regulation {
    #[default]
    Off,
    PowerPoint,
    ConstantVoltage,
    ConstantCurrent,
}

#[derive(Debug, Clone, Copy)]
pub struct ChargeInputs {
    /// True while the system state machine is charging.
    pub panel_available: bool,
    pub protection: ProtectionState,
    pub battery_voltage: f32,
    pub battery_current: f32,
    pub now: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: ChargePhase,
    pub to: ChargePhase,
}

#[derive(Debug, Clone)]
pub struct ChargeController {
    config: ChargeConfig,
    phase: ChargePhase,
    phase_started: Duration,
}

impl ChargeController {
    pub fn new(config: &ChargeConfig) -> Self {
        Self {
            config: config.clone(),
            phase: ChargePhase::Off,
            phase_started: Duration::ZERO,
        }
    }

    pub fn phase(&self) -> ChargePhase {
        self.phase
    }

    pub fn time_in_phase(&self, now: Duration) -> Duration {
        now.saturating_sub(self.phase_started)
    }

    /// Transition function. `max_current` is the effective current ceiling
    /// used for the absorption tail-current test.
    pub fn next_phase(
        &self,
        profile: &BatteryProfile,
        inputs: &ChargeInputs,
        max_current: f32,
    ) -> ChargePhase {
        if !inputs.panel_available || inputs.protection >= ProtectionState::Fault {
            return ChargePhase::Off;
        }
        let v = inputs.battery_voltage;
        let elapsed = self.time_in_phase(inputs.now);
        let rebulk = v < profile.float_voltage - self.config.rebulk_offset;
        match self.phase {
            ChargePhase::Off if v < profile.bulk_voltage => ChargePhase::Bulk,
            ChargePhase::Off => ChargePhase::Float,
            ChargePhase::Bulk if v >= profile.bulk_voltage => ChargePhase::Absorption,
            ChargePhase::Bulk => ChargePhase::Bulk,
            ChargePhase::Absorption => {
                let tail = elapsed >= self.config.min_absorption_dwell
                    && inputs.battery_current < self.config.tail_current_fraction * max_current;
                if elapsed >= profile.absorption_time || tail {
                    ChargePhase::Float
                } else {
                    ChargePhase::Absorption
                }
            }
            ChargePhase::Float if rebulk => ChargePhase::Off,
            ChargePhase::Float
                if profile.use_equalization && elapsed >= self.config.equalization_interval =>
            {
                ChargePhase::Equalization
            }
            ChargePhase::Float
                if !profile.use_equalization && elapsed >= self.config.float_duration =>
            {
                ChargePhase::Maintenance
            }
            ChargePhase::Float => ChargePhase::Float,
            ChargePhase::Equalization if elapsed >= self.config.equalization_duration => {
                ChargePhase::Maintenance
            }
            ChargePhase::Equalization => ChargePhase::Equalization,
            ChargePhase::Maintenance if rebulk => ChargePhase::Off,
            ChargePhase::Maintenance => ChargePhase::Maintenance,
        }
    }

    /// Evaluate and apply at most one phase transition.
    pub fn update(
        &mut self,
        profile: &BatteryProfile,
        inputs: &ChargeInputs,
        max_current: f32,
    ) -> Option<PhaseChange> {
        let next = self.next_phase(profile, inputs, max_current);
        self.enter(next, inputs.now, inputs.battery_voltage)
    }

    /// Drop to Off outside of charging.
    pub fn force_off(&mut self, now: Duration) -> Option<PhaseChange> {
        self.enter(ChargePhase::Off, now, f32::NAN)
    }

    fn enter(&mut self, next: ChargePhase, now: Duration, battery_voltage: f32) -> Option<PhaseChange> {
        if next == self.phase {
            return None;
        }
        let change = PhaseChange {
            from: self.phase,
            to: next,
        };
        info!(
            from = %change.from,
            to = %change.to,
            battery_voltage,
            after_s = self.time_in_phase(now).as_secs(),
            "charge phase change"
        );
        self.phase = next;
        self.phase_started = now;
        Some(change)
    }

    pub fn target(&self, profile: &BatteryProfile, max_current: f32) -> ChargeTarget {
        let voltage_ceiling = match self.phase {
            ChargePhase::Off => 0.0,
            ChargePhase::Bulk => profile.bulk_voltage,
            ChargePhase::Absorption => profile.absorption_voltage,
            ChargePhase::Float => profile.float_voltage,
            ChargePhase::Equalization => profile.equalization_voltage,
            ChargePhase::Maintenance => profile.float_voltage - self.config.maintenance_offset,
        };
        let current_ceiling = match self.phase {
            ChargePhase::Off => 0.0,
            _ => max_current,
        };
        ChargeTarget {
            voltage_ceiling,
            current_ceiling,
        }
    }

    /// Clamp the tracker's proposal so the battery never exceeds the phase
    /// ceilings. When a ceiling binds the duty backs off from the applied
    /// value by one regulation step per cycle.
    pub fn regulate(
        &self,
        target: &ChargeTarget,
        proposed: f32,
        applied: f32,
        reading: &ConditionedReading,
    ) -> (f32, Regulation) {
        if self.phase == ChargePhase::Off {
            return (0.0, Regulation::Off);
        }
        let backed_off = proposed.min(applied - self.config.regulation_step).max(0.0);
        if reading.battery_voltage >= target.voltage_ceiling {
            (backed_off, Regulation::ConstantVoltage)
        } else if reading.battery_current >= target.current_ceiling {
            (backed_off, Regulation::ConstantCurrent)
        } else {
            (proposed, Regulation::PowerPoint)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileCatalog;
    use r_mppt_common::BatteryType;

    fn inputs(battery_voltage: f32, battery_current: f32, now_s: u64) -> ChargeInputs {
        ChargeInputs {
            panel_available: true,
            protection: ProtectionState::Normal,
            battery_voltage,
            battery_current,
            now: Duration::from_secs(now_s),
        }
    }

    fn profile(battery_type: BatteryType) -> BatteryProfile {
        ProfileCatalog::builtin().get(battery_type).clone()
    }

    #[test]
    fn bulk_and_absorption_ceilings_never_exceed_profile() {
        let catalog = ProfileCatalog::builtin();
        for (battery_type, p) in catalog.iter() {
            let max = p.max_charge_current;
            let mut charger = ChargeController::new(&ChargeConfig::default());
            charger.update(p, &inputs(p.bulk_voltage - 1.0, 1.0, 0), max);
            assert_eq!(charger.phase(), ChargePhase::Bulk, "{battery_type:?}");
            let target = charger.target(p, max);
            assert!(target.voltage_ceiling <= p.bulk_voltage, "{battery_type:?} bulk");
            assert!(target.current_ceiling <= max);

            charger.update(p, &inputs(p.bulk_voltage, 1.0, 10), max);
            assert_eq!(charger.phase(), ChargePhase::Absorption, "{battery_type:?}");
            let target = charger.target(p, max);
            assert!(
                target.voltage_ceiling <= p.absorption_voltage,
                "{battery_type:?} absorption"
            );
            assert!(target.voltage_ceiling <= p.bulk_voltage);
        }
    }

    #[test]
    fn walks_through_agm_phases() {
        let agm = profile(BatteryType::Agm);
        let mut charger = ChargeController::new(&ChargeConfig::default());
        charger.update(&agm, &inputs(12.4, 4.0, 0), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Bulk);
        charger.update(&agm, &inputs(14.3, 4.0, 600), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Bulk);
        charger.update(&agm, &inputs(14.5, 4.0, 900), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Absorption);
        // Current has not tapered, so the absorption timer decides.
        charger.update(&agm, &inputs(14.4, 3.0, 900 + 119 * 60), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Absorption);
        charger.update(&agm, &inputs(14.4, 3.0, 900 + 120 * 60), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Float);
        let float_at = 900 + 120 * 60;
        charger.update(&agm, &inputs(13.8, 0.3, float_at + 4 * 3600), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Maintenance);
        let target = charger.target(&agm, 5.0);
        assert!((target.voltage_ceiling - 13.5).abs() < 1e-4);
        charger.update(&agm, &inputs(12.9, 0.0, float_at + 5 * 3600), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Off);
    }

    #[test]
    fn absorption_ends_on_tail_current() {
        let agm = profile(BatteryType::Agm);
        let mut charger = ChargeController::new(&ChargeConfig::default());
        charger.update(&agm, &inputs(14.6, 4.0, 0), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Float, "already full");

        let mut charger = ChargeController::new(&ChargeConfig::default());
        charger.update(&agm, &inputs(13.0, 4.0, 0), 5.0);
        charger.update(&agm, &inputs(14.5, 4.0, 10), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Absorption);
        charger.update(&agm, &inputs(14.4, 0.2, 30), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Absorption, "dwell not reached");
        charger.update(&agm, &inputs(14.4, 0.2, 80), 5.0);
        assert_eq!(charger.phase(), ChargePhase::Float);
    }

    #[test]
    fn lead_acid_equalizes_from_float() {
        let lead = profile(BatteryType::LeadAcid);
        let config = ChargeConfig::default();
        let mut charger = ChargeController::new(&config);
        charger.update(&lead, &inputs(14.8, 0.5, 0), 10.0);
        assert_eq!(charger.phase(), ChargePhase::Float);
        let at = config.equalization_interval.as_secs();
        charger.update(&lead, &inputs(13.5, 0.5, at), 10.0);
        assert_eq!(charger.phase(), ChargePhase::Equalization);
        assert_eq!(charger.target(&lead, 10.0).voltage_ceiling, 14.9);
        charger.update(&lead, &inputs(14.9, 0.5, at + config.equalization_duration.as_secs()), 10.0);
        assert_eq!(charger.phase(), ChargePhase::Maintenance);
    }

    #[test]
    fn fault_or_missing_panel_forces_off() {
        let agm = profile(BatteryType::Agm);
        let mut charger = ChargeController::new(&ChargeConfig::default());
        charger.update(&agm, &inputs(12.4, 4.0, 0), 5.0);
        let mut faulted = inputs(12.4, 4.0, 1);
        faulted.protection = ProtectionState::Fault;
        let change = charger.update(&agm, &faulted, 5.0);
        assert_eq!(
            change,
            Some(PhaseChange {
                from: ChargePhase::Bulk,
                to: ChargePhase::Off
            })
        );
        assert_eq!(charger.target(&agm, 5.0).current_ceiling, 0.0);
    }

    #[test]
    fn clamp_backs_off_at_ceilings() {
        let agm = profile(BatteryType::Agm);
        let mut charger = ChargeController::new(&ChargeConfig::default());
        charger.update(&agm, &inputs(12.4, 4.0, 0), 5.0);
        let target = charger.target(&agm, 5.0);
        let mut reading = ConditionedReading {
            battery_voltage: 13.0,
            battery_current: 3.0,
            ..ConditionedReading::default()
        };
        assert_eq!(
            charger.regulate(&target, 0.62, 0.6, &reading),
            (0.62, Regulation::PowerPoint)
        );

        reading.battery_voltage = 14.55;
        let (duty, mode) = charger.regulate(&target, 0.62, 0.6, &reading);
        assert_eq!(mode, Regulation::ConstantVoltage);
        assert!(duty < 0.6);

        reading.battery_voltage = 13.0;
        reading.battery_current = 5.2;
        let (duty, mode) = charger.regulate(&target, 0.55, 0.6, &reading);
        assert_eq!(mode, Regulation::ConstantCurrent);
        assert_eq!(duty, 0.55);
    }
}
