//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Shared primitives and utilities for the control runtime."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_tick_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_cycle_budget() -> Duration {
    Duration::from_millis(100)
}

fn default_calibration_samples() -> usize {
    100
}

fn default_max_calibration_offset() -> f32 {
    800.0
}

fn default_sleep_after() -> Duration {
    Duration::from_secs(600)
}

fn default_history_capacity() -> usize {
    1000
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_simulation_seed() -> u64 {
    0x5EED_u64
}

/// Primary configuration object for the R-MPPT runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub charge: ChargeConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_MPPT_CONFIG";

    /// Load configuration from disk, respecting the `R_MPPT_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        self.filter.validate()?;
        self.hardware.validate()?;
        self.tracker.validate()?;
        self.charge.validate()?;
        self.protection.validate()?;
        self.simulation.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Control loop timing, start-up and state machine thresholds.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    /// Longest acceptable sensor acquisition before a sample counts as stale.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cycle_budget: Duration,
    #[serde(default = "default_calibration_samples")]
    pub calibration_samples: usize,
    pub skip_calibration: bool,
    /// Largest accepted zero-input offset, in raw ADC counts.
    #[serde(default = "default_max_calibration_offset")]
    pub max_calibration_offset: f32,
    pub self_test_min_temperature: f32,
    pub self_test_max_temperature: f32,
    pub self_test_voltage_tolerance: f32,
    /// Consecutive failed acquisitions before a sensor warning escalates to a fault.
    pub sensor_fault_cycles: u32,
    /// Panel must exceed the battery by this many volts before charging starts.
    pub panel_headroom: f32,
    pub charge_stop_power: f32,
    pub charge_grace_cycles: u32,
    /// Wait after charging stops before the panel counts as available again.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub charge_retry_delay: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sleep_after: Duration,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            cycle_budget: default_cycle_budget(),
            calibration_samples: default_calibration_samples(),
            skip_calibration: false,
            max_calibration_offset: default_max_calibration_offset(),
            self_test_min_temperature: -20.0,
            self_test_max_temperature: 85.0,
            self_test_voltage_tolerance: 0.5,
            sensor_fault_cycles: 3,
            panel_headroom: 0.5,
            charge_stop_power: 2.0,
            charge_grace_cycles: 20,
            charge_retry_delay: Duration::from_secs(60),
            sleep_after: default_sleep_after(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(anyhow!("controller.tick_interval must be greater than zero"));
        }
        if !self.skip_calibration && self.calibration_samples == 0 {
            return Err(anyhow!(
                "controller.calibration_samples must be positive unless calibration is skipped"
            ));
        }
        if self.history_capacity == 0 {
            return Err(anyhow!("controller.history_capacity must be positive"));
        }
        if self.self_test_min_temperature >= self.self_test_max_temperature {
            return Err(anyhow!(
                "controller self-test temperature window is empty ({} >= {})",
                self.self_test_min_temperature,
                self.self_test_max_temperature
            ));
        }
        Ok(())
    }
}

/// Supported battery chemistries.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum BatteryType {
    #[default]
    #[serde(rename = "agm")]
    Agm,
    #[serde(rename = "lifepo4")]
    LiFePo4,
    #[serde(rename = "lead-acid")]
    LeadAcid,
    #[serde(rename = "custom")]
    Custom,
}

impl BatteryType {
    pub const ALL: [BatteryType; 4] = [
        BatteryType::Agm,
        BatteryType::LiFePo4,
        BatteryType::LeadAcid,
        BatteryType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatteryType::Agm => "agm",
            BatteryType::LiFePo4 => "lifepo4",
            BatteryType::LeadAcid => "lead-acid",
            BatteryType::Custom => "custom",
        }
    }
}

impl fmt::Display for BatteryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatteryType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "agm" => Ok(BatteryType::Agm),
            "lifepo4" => Ok(BatteryType::LiFePo4),
            "lead-acid" | "leadacid" => Ok(BatteryType::LeadAcid),
            "custom" => Ok(BatteryType::Custom),
            other => Err(format!("unknown battery type: {}", other)),
        }
    }
}

/// Battery selection plus an optional override for the custom slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatteryConfig {
    #[serde(default, rename = "type")]
    pub battery_type: BatteryType,
    #[serde(default)]
    pub custom: Option<BatteryProfileConfig>,
}

/// User supplied charging profile. Validated by the control core before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryProfileConfig {
    pub bulk_voltage: f32,
    pub absorption_voltage: f32,
    pub float_voltage: f32,
    pub equalization_voltage: f32,
    pub min_voltage: f32,
    pub max_charge_current: f32,
    #[serde(default)]
    pub use_equalization: bool,
    pub absorption_minutes: u32,
    #[serde(default = "default_custom_name")]
    pub name: String,
}

fn default_custom_name() -> String {
    "CUSTOM".to_owned()
}

/// Single-pole filter coefficients per signal class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub alpha_voltage: f32,
    pub alpha_current: f32,
    pub alpha_temperature: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            alpha_voltage: 0.05,
            alpha_current: 0.1,
            alpha_temperature: 0.02,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, alpha) in [
            ("alpha_voltage", self.alpha_voltage),
            ("alpha_current", self.alpha_current),
            ("alpha_temperature", self.alpha_temperature),
        ] {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(anyhow!("filter.{} must be within (0, 1], got {}", name, alpha));
            }
        }
        Ok(())
    }
}

/// Analog front-end and PWM constants of the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Millivolts per ADC count.
    pub adc_scale_mv: f32,
    pub voltage_divider_ratio: f32,
    pub shunt_resistance_ohm: f32,
    pub temperature_adc_reference: f32,
    pub temperature_adc_max: u16,
    pub temperature_mv_per_degree: f32,
    pub pwm_resolution_bits: u8,
    pub pwm_frequency_hz: u32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            adc_scale_mv: 0.125,
            voltage_divider_ratio: 5.11,
            shunt_resistance_ohm: 0.01,
            temperature_adc_reference: 3.3,
            temperature_adc_max: 4095,
            temperature_mv_per_degree: 10.0,
            pwm_resolution_bits: 10,
            pwm_frequency_hz: 20_000,
        }
    }
}

impl HardwareConfig {
    pub fn validate(&self) -> Result<()> {
        if self.adc_scale_mv <= 0.0 || self.voltage_divider_ratio <= 0.0 {
            return Err(anyhow!("hardware ADC scale and divider ratio must be positive"));
        }
        if self.shunt_resistance_ohm <= 0.0 {
            return Err(anyhow!("hardware.shunt_resistance_ohm must be positive"));
        }
        if self.temperature_adc_max == 0 || self.temperature_mv_per_degree <= 0.0 {
            return Err(anyhow!("hardware temperature front-end constants must be positive"));
        }
        if !(1..=16).contains(&self.pwm_resolution_bits) {
            return Err(anyhow!(
                "hardware.pwm_resolution_bits must be within 1..=16, got {}",
                self.pwm_resolution_bits
            ));
        }
        Ok(())
    }

    /// Largest PWM compare value for the configured resolution.
    pub fn pwm_max_counts(&self) -> u16 {
        ((1u32 << self.pwm_resolution_bits) - 1) as u16
    }
}

/// Perturb & observe tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub step_size: f32,
    pub scan_step_multiplier: f32,
    pub scan_settle_cycles: u32,
    /// Relative improvement of the best power point that still counts as settled.
    pub scan_tolerance: f32,
    /// Power change in watts treated as noise.
    pub noise_threshold: f32,
    pub hold_cycles: u32,
    pub retrack_threshold: f32,
    pub low_power_threshold: f32,
    pub low_power_hysteresis: f32,
    /// Only every n-th observation perturbs the duty cycle while in low power.
    pub low_power_divider: u32,
    /// Control cycles between power observations, letting the filtered power
    /// settle after each duty change.
    pub perturb_interval: u32,
    pub initial_duty: f32,
    pub min_duty: f32,
    pub max_duty: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            step_size: 0.01,
            scan_step_multiplier: 5.0,
            scan_settle_cycles: 3,
            scan_tolerance: 0.02,
            noise_threshold: 0.1,
            hold_cycles: 5,
            retrack_threshold: 1.0,
            low_power_threshold: 3.0,
            low_power_hysteresis: 1.0,
            low_power_divider: 10,
            perturb_interval: 10,
            initial_duty: 0.1,
            min_duty: 0.0,
            max_duty: 0.95,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step_size <= 0.0 || self.scan_step_multiplier < 1.0 {
            return Err(anyhow!(
                "tracker step size must be positive and the scan multiplier at least 1"
            ));
        }
        if !(0.0..=1.0).contains(&self.min_duty)
            || !(0.0..=1.0).contains(&self.max_duty)
            || self.min_duty >= self.max_duty
        {
            return Err(anyhow!(
                "tracker duty bounds must satisfy 0 <= min_duty < max_duty <= 1"
            ));
        }
        if self.initial_duty < self.min_duty || self.initial_duty > self.max_duty {
            return Err(anyhow!("tracker.initial_duty must lie within the duty bounds"));
        }
        if self.low_power_divider == 0
            || self.hold_cycles == 0
            || self.scan_settle_cycles == 0
            || self.perturb_interval == 0
        {
            return Err(anyhow!("tracker cycle counts must be positive"));
        }
        Ok(())
    }
}

/// Charge sequencing timers and regulation constants.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargeConfig {
    /// Absorption ends once current tapers below this fraction of the max charge current.
    pub tail_current_fraction: f32,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub min_absorption_dwell: Duration,
    /// Float time before dropping into maintenance when equalization is disabled.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub float_duration: Duration,
    /// Float time before an equalization charge when the profile enables it.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub equalization_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub equalization_duration: Duration,
    pub maintenance_offset: f32,
    pub rebulk_offset: f32,
    /// Duty decrement applied per cycle while a voltage or current ceiling binds.
    pub regulation_step: f32,
}

impl Default for ChargeConfig {
    fn default() -> Self {
        Self {
            tail_current_fraction: 0.1,
            min_absorption_dwell: Duration::from_secs(60),
            float_duration: Duration::from_secs(4 * 3600),
            equalization_interval: Duration::from_secs(24 * 3600),
            equalization_duration: Duration::from_secs(2 * 3600),
            maintenance_offset: 0.3,
            rebulk_offset: 0.8,
            regulation_step: 0.005,
        }
    }
}

impl ChargeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.tail_current_fraction) {
            return Err(anyhow!("charge.tail_current_fraction must be within [0, 1)"));
        }
        if self.regulation_step <= 0.0 {
            return Err(anyhow!("charge.regulation_step must be positive"));
        }
        if self.maintenance_offset < 0.0 || self.rebulk_offset <= self.maintenance_offset {
            return Err(anyhow!(
                "charge.rebulk_offset must exceed charge.maintenance_offset"
            ));
        }
        Ok(())
    }
}

/// Hard protection limits. Defaults mirror a 12 V AGM installation.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub battery_voltage_critical_high: f32,
    pub battery_voltage_low: f32,
    pub battery_voltage_critical_low: f32,
    pub battery_voltage_hysteresis: f32,
    pub max_charge_current: f32,
    pub max_discharge_current: f32,
    pub short_circuit_threshold: f32,
    /// Amperes per millisecond.
    pub max_current_rise_rate: f32,
    pub current_hysteresis: f32,
    pub temperature_max: f32,
    pub temperature_warning: f32,
    pub temperature_hysteresis: f32,
    pub panel_voltage_max: f32,
    pub panel_voltage_min: f32,
    pub warning_duty_cap: f32,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub fault_cooldown: Duration,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            battery_voltage_critical_high: 15.0,
            battery_voltage_low: 11.0,
            battery_voltage_critical_low: 10.0,
            battery_voltage_hysteresis: 0.2,
            max_charge_current: 5.0,
            max_discharge_current: 30.0,
            short_circuit_threshold: 50.0,
            max_current_rise_rate: 100.0,
            current_hysteresis: 1.0,
            temperature_max: 70.0,
            temperature_warning: 60.0,
            temperature_hysteresis: 5.0,
            panel_voltage_max: 60.0,
            panel_voltage_min: 10.0,
            warning_duty_cap: 0.5,
            fault_cooldown: Duration::from_secs(30),
        }
    }
}

impl ProtectionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.battery_voltage_critical_low < self.battery_voltage_low
            && self.battery_voltage_low < self.battery_voltage_critical_high)
        {
            return Err(anyhow!(
                "protection voltages must satisfy critical_low < low < critical_high"
            ));
        }
        if self.battery_voltage_hysteresis < 0.0
            || self.current_hysteresis < 0.0
            || self.temperature_hysteresis < 0.0
        {
            return Err(anyhow!("protection hysteresis bands must not be negative"));
        }
        if self.temperature_warning >= self.temperature_max {
            return Err(anyhow!(
                "protection.temperature_warning must be below protection.temperature_max"
            ));
        }
        if self.max_charge_current <= 0.0 || self.short_circuit_threshold <= self.max_charge_current
        {
            return Err(anyhow!(
                "protection.short_circuit_threshold must exceed a positive max_charge_current"
            ));
        }
        if self.panel_voltage_min >= self.panel_voltage_max {
            return Err(anyhow!(
                "protection.panel_voltage_min must be below protection.panel_voltage_max"
            ));
        }
        if !(0.0..=1.0).contains(&self.warning_duty_cap) {
            return Err(anyhow!("protection.warning_duty_cap must be within [0, 1]"));
        }
        if self.max_current_rise_rate <= 0.0 {
            return Err(anyhow!("protection.max_current_rise_rate must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Parameters of the simulated solar plant used when no hardware is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    #[serde(default = "default_simulation_seed")]
    pub random_seed: u64,
    /// Standard deviation of the additive ADC noise, in raw counts.
    pub noise_sigma: f64,
    pub scenario_file: Option<PathBuf>,
    pub initial_soc: f64,
    pub speedup: f64,
    pub panel_voc: f64,
    pub panel_isc: f64,
    pub battery_capacity_ah: f64,
    pub ambient_temperature: f64,
    /// Constant DC load on the battery, in amperes.
    pub load_current: f64,
    /// Fixed irradiance fraction; without it and without a scenario the sun follows a day curve.
    pub constant_irradiance: Option<f64>,
    /// Hour of day the simulated clock starts at.
    pub start_hour: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            random_seed: default_simulation_seed(),
            noise_sigma: 2.0,
            scenario_file: None,
            initial_soc: 0.5,
            speedup: 1.0,
            panel_voc: 20.0,
            panel_isc: 3.5,
            battery_capacity_ah: 100.0,
            ambient_temperature: 25.0,
            load_current: 0.0,
            constant_irradiance: None,
            start_hour: 8.0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.initial_soc) {
            return Err(anyhow!("simulation.initial_soc must be within [0, 1]"));
        }
        if self.speedup <= 0.0 {
            return Err(anyhow!("simulation.speedup must be positive"));
        }
        if self.panel_voc <= 0.0 || self.panel_isc <= 0.0 || self.battery_capacity_ah <= 0.0 {
            return Err(anyhow!("simulation plant parameters must be positive"));
        }
        if self.noise_sigma < 0.0 || self.load_current < 0.0 {
            return Err(anyhow!(
                "simulation.noise_sigma and simulation.load_current must not be negative"
            ));
        }
        if self
            .constant_irradiance
            .is_some_and(|irradiance| !(0.0..=1.5).contains(&irradiance))
        {
            return Err(anyhow!("simulation.constant_irradiance must be within [0, 1.5]"));
        }
        if !(0.0..24.0).contains(&self.start_hour) {
            return Err(anyhow!("simulation.start_hour must be within [0, 24)"));
        }
        Ok(())
    }
}
