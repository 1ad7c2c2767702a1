//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Battery chemistry catalog and profile validation.

use std::time::Duration;

use r_mppt_common::{BatteryConfig, BatteryProfileConfig, BatteryType, ProtectionConfig};
use serde::Serialize;
use tracing::info;

use crate::error::{CoreError, Result};

/// Charging setpoints for one chemistry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryProfile {
    pub name: String,
    pub bulk_voltage: f32,
    pub absorption_voltage: f32,
    pub float_voltage: f32,
    pub equalization_voltage: f32,
    pub min_voltage: f32,
    pub max_charge_current: f32,
    pub use_equalization: bool,
    pub absorption_time: Duration,
}

impl BatteryProfile {
    #[allow(clippy::too_many_arguments)]
    fn builtin(
        name: &str,
        bulk_voltage: f32,
        absorption_voltage: f32,
        float_voltage: f32,
        equalization_voltage: f32,
        min_voltage: f32,
        max_charge_current: f32,
        use_equalization: bool,
        absorption_minutes: u64,
    ) -> Self {
        Self {
            name: name.to_owned(),
            bulk_voltage,
            absorption_voltage,
            float_voltage,
            equalization_voltage,
            min_voltage,
            max_charge_current,
            use_equalization,
            absorption_time: Duration::from_secs(absorption_minutes * 60),
        }
    }

    pub fn from_config(config: &BatteryProfileConfig) -> Self {
        Self {
            name: config.name.clone(),
            bulk_voltage: config.bulk_voltage,
            absorption_voltage: config.absorption_voltage,
            float_voltage: config.float_voltage,
            equalization_voltage: config.equalization_voltage,
            min_voltage: config.min_voltage,
            max_charge_current: config.max_charge_current,
            use_equalization: config.use_equalization,
            absorption_time: Duration::from_secs(u64::from(config.absorption_minutes) * 60),
        }
    }

    /// Check the profile ordering and that every setpoint stays below the
    /// emergency over-voltage limit.
    pub fn validate(&self, limits: &ProtectionConfig) -> Result<()> {
        let setpoints = [
            self.bulk_voltage,
            self.absorption_voltage,
            self.float_voltage,
            self.equalization_voltage,
            self.min_voltage,
            self.max_charge_current,
        ];
        if setpoints.iter().any(|value| !value.is_finite()) {
            return Err(invalid(self, "setpoints must be finite"));
        }
        if self.min_voltage <= 0.0 || self.min_voltage >= self.float_voltage {
            return Err(invalid(self, "min_voltage must be positive and below float_voltage"));
        }
        if !(self.float_voltage < self.absorption_voltage
            && self.absorption_voltage <= self.bulk_voltage)
        {
            return Err(invalid(self, "expected float < absorption <= bulk"));
        }
        if self.equalization_voltage < self.absorption_voltage {
            return Err(invalid(self, "equalization_voltage must not be below absorption_voltage"));
        }
        let critical = limits.battery_voltage_critical_high;
        if self.bulk_voltage >= critical || self.equalization_voltage >= critical {
            return Err(invalid(
                self,
                &format!("charge voltages must stay below the {critical:.2} V emergency limit"),
            ));
        }
        if self.max_charge_current <= 0.0 {
            return Err(invalid(self, "max_charge_current must be positive"));
        }
        if self.absorption_time.is_zero() {
            return Err(invalid(self, "absorption time must be positive"));
        }
        Ok(())
    }
}

fn invalid(profile: &BatteryProfile, reason: &str) -> CoreError {
    CoreError::Configuration(format!("battery profile {}: {reason}", profile.name))
}

/// The four selectable profiles and the active selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileCatalog {
    profiles: [BatteryProfile; 4],
    selected: BatteryType,
}

impl ProfileCatalog {
    pub fn builtin() -> Self {
        Self {
            profiles: [
                BatteryProfile::builtin("AGM", 14.5, 14.4, 13.8, 14.8, 12.0, 5.0, false, 120),
                BatteryProfile::builtin("LiFePO4", 14.6, 14.2, 13.8, 14.8, 10.0, 20.0, false, 60),
                BatteryProfile::builtin("Lead-Acid", 14.7, 14.4, 13.5, 14.9, 11.5, 10.0, true, 180),
                BatteryProfile::builtin("CUSTOM", 14.0, 14.0, 13.5, 14.5, 12.0, 5.0, false, 120),
            ],
            selected: BatteryType::Agm,
        }
    }

    /// Built-in catalog with the configured custom override and selection applied.
    /// Every profile is validated against `limits`; nothing is applied on error.
    pub fn from_config(config: &BatteryConfig, limits: &ProtectionConfig) -> Result<Self> {
        let mut catalog = Self::builtin();
        if let Some(custom) = &config.custom {
            catalog.profiles[slot(BatteryType::Custom)] = BatteryProfile::from_config(custom);
        }
        catalog.validate(limits)?;
        catalog.selected = config.battery_type;
        info!(
            battery = %catalog.selected,
            profile = %catalog.current().name,
            "battery profile selected"
        );
        Ok(catalog)
    }

    pub fn validate(&self, limits: &ProtectionConfig) -> Result<()> {
        self.profiles
            .iter()
            .try_for_each(|profile| profile.validate(limits))
    }

    pub fn current(&self) -> &BatteryProfile {
        self.get(self.selected)
    }

    pub fn selected(&self) -> BatteryType {
        self.selected
    }

    pub fn get(&self, battery_type: BatteryType) -> &BatteryProfile {
        &self.profiles[slot(battery_type)]
    }

    pub fn select(&mut self, battery_type: BatteryType) {
        self.selected = battery_type;
    }

    pub fn iter(&self) -> impl Iterator<Item = (BatteryType, &BatteryProfile)> {
        BatteryType::ALL
            .into_iter()
            .map(move |battery_type| (battery_type, self.get(battery_type)))
    }
}

impl Default for ProfileCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn slot(battery_type: BatteryType) -> usize {
    match battery_type {
        BatteryType::Agm => 0,
        BatteryType::LiFePo4 => 1,
        BatteryType::LeadAcid => 2,
        BatteryType::Custom => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_satisfy_ordering() {
        let limits = ProtectionConfig::default();
        let catalog = ProfileCatalog::builtin();
        for (battery_type, profile) in catalog.iter() {
            profile.validate(&limits).unwrap();
            assert!(profile.float_voltage < profile.absorption_voltage, "{battery_type}");
            assert!(profile.absorption_voltage <= profile.bulk_voltage, "{battery_type}");
            assert!(profile.bulk_voltage < limits.battery_voltage_critical_high);
            assert!(profile.equalization_voltage < limits.battery_voltage_critical_high);
        }
        assert!(catalog.get(BatteryType::LeadAcid).use_equalization);
        assert_eq!(
            catalog.get(BatteryType::LiFePo4).absorption_time,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn selects_configured_profile() {
        let config = BatteryConfig {
            battery_type: BatteryType::LiFePo4,
            custom: None,
        };
        let catalog = ProfileCatalog::from_config(&config, &ProtectionConfig::default()).unwrap();
        assert_eq!(catalog.current().name, "LiFePO4");
        assert_eq!(catalog.current().max_charge_current, 20.0);
    }

    #[test]
    fn rejects_custom_profile_above_emergency_limit() {
        let config = BatteryConfig {
            battery_type: BatteryType::Custom,
            custom: Some(BatteryProfileConfig {
                bulk_voltage: 15.5,
                absorption_voltage: 15.0,
                float_voltage: 13.8,
                equalization_voltage: 15.5,
                min_voltage: 11.0,
                max_charge_current: 5.0,
                use_equalization: false,
                absorption_minutes: 60,
                name: "HOT".into(),
            }),
        };
        let err = ProfileCatalog::from_config(&config, &ProtectionConfig::default()).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(message) if message.contains("HOT")));
    }

    #[test]
    fn rejects_inverted_float_and_absorption() {
        let mut profile = ProfileCatalog::builtin().get(BatteryType::Agm).clone();
        profile.float_voltage = 14.45;
        assert!(profile.validate(&ProtectionConfig::default()).is_err());
    }
}
