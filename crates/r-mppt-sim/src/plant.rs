//! ---
//! mppt_section: "11-simulation-test-harness"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Simulation runtime helpers and scenario engines."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Quasi-static electrical model with slow battery and thermal states.
//!
//! Panel: single-diode approximation `I = Isc * (G - exp((V - Voc) / Vt))`.
//! Converter: ideal buck, `Vpanel = Vbat / duty`, fixed efficiency.
//! Battery: open-circuit voltage rising with state of charge plus an internal
//! resistance that grows near full charge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use r_mppt_common::{HardwareConfig, SimulationConfig};
use r_mppt_core::{
    Actuator, ActuatorCommand, AnalogFrontEnd, Channel, RawSample, SensorError, SensorSource,
};
use rand::prelude::*;
use rand_distr::Normal;
use serde::Serialize;
use tracing::{debug, warn};

const MAX_SUBSTEP: Duration = Duration::from_secs(1);
const SOLVER_ITERATIONS: usize = 8;
const MIN_CONDUCTING_DUTY: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct PlantParameters {
    pub panel_voc: f64,
    pub panel_isc: f64,
    /// Diode thermal voltage of the whole string.
    pub panel_thermal_voltage: f64,
    pub converter_efficiency: f64,
    pub battery_capacity_ah: f64,
    pub battery_resistance: f64,
    pub initial_soc: f64,
    pub load_current: f64,
    pub ambient_temperature: f64,
    /// Heatsink rise in °C per watt dissipated.
    pub thermal_resistance: f64,
    pub thermal_time_constant: Duration,
}

impl PlantParameters {
    pub fn from_config(sim: &SimulationConfig) -> Self {
        Self {
            panel_voc: sim.panel_voc,
            panel_isc: sim.panel_isc,
            panel_thermal_voltage: 1.2,
            converter_efficiency: 0.95,
            battery_capacity_ah: sim.battery_capacity_ah,
            battery_resistance: 0.03,
            initial_soc: sim.initial_soc,
            load_current: sim.load_current,
            ambient_temperature: sim.ambient_temperature,
            thermal_resistance: 1.5,
            thermal_time_constant: Duration::from_secs(120),
        }
    }

    fn open_circuit_voltage(&self, soc: f64) -> f64 {
        11.9 + 0.9 * soc + 1.2 * ((soc - 0.9).max(0.0) / 0.1)
    }

    fn internal_resistance(&self, soc: f64) -> f64 {
        self.battery_resistance + 0.1 * ((soc - 0.8).max(0.0) / 0.2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlantState {
    pub soc: f64,
    pub irradiance: f64,
    pub ambient_temperature: f64,
    pub panel_voltage: f64,
    pub panel_current: f64,
    pub battery_voltage: f64,
    /// Positive while charging.
    pub battery_current: f64,
    pub temperature: f64,
}

impl PlantState {
    pub fn panel_power(&self) -> f64 {
        self.panel_voltage * self.panel_current
    }
}

#[derive(Debug)]
pub struct SolarPlant {
    params: PlantParameters,
    state: PlantState,
    command: ActuatorCommand,
    front_end: AnalogFrontEnd,
    temperature_max_counts: f64,
    rng: StdRng,
    noise: Normal<f64>,
    /// Zero-input ADC offsets: current, panel voltage, battery voltage.
    offsets: [f64; 3],
    pending_failures: u32,
}

impl SolarPlant {
    pub fn new(
        params: PlantParameters,
        hardware: &HardwareConfig,
        seed: u64,
        noise_sigma: f64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, noise_sigma)
            .map_err(|err| anyhow!("invalid simulation noise sigma {noise_sigma}: {err}"))?;
        let offsets = [
            rng.gen_range(-12.0..12.0),
            rng.gen_range(-12.0..12.0),
            rng.gen_range(-12.0..12.0),
        ];
        let soc = params.initial_soc.clamp(0.0, 1.0);
        let state = PlantState {
            soc,
            irradiance: 0.0,
            ambient_temperature: params.ambient_temperature,
            panel_voltage: 0.0,
            panel_current: 0.0,
            battery_voltage: params.open_circuit_voltage(soc),
            battery_current: 0.0,
            temperature: params.ambient_temperature,
        };
        let mut plant = Self {
            params,
            state,
            command: ActuatorCommand::safe(),
            front_end: AnalogFrontEnd::new(hardware),
            temperature_max_counts: f64::from(hardware.temperature_adc_max),
            rng,
            noise,
            offsets,
            pending_failures: 0,
        };
        plant.solve();
        Ok(plant)
    }

    pub fn state(&self) -> PlantState {
        self.state
    }

    pub fn params(&self) -> &PlantParameters {
        &self.params
    }

    pub fn command(&self) -> ActuatorCommand {
        self.command
    }

    pub fn set_conditions(&mut self, irradiance: f64, ambient_temperature: Option<f64>) {
        self.state.irradiance = irradiance.max(0.0);
        if let Some(ambient) = ambient_temperature {
            self.state.ambient_temperature = ambient;
        }
        self.solve();
    }

    pub fn apply(&mut self, command: &ActuatorCommand) {
        self.command = *command;
        self.solve();
    }

    /// Make the next `count` reads fail as if the converter stopped answering.
    pub fn inject_sensor_failures(&mut self, count: u32) {
        warn!(count, "injecting simulated sensor failures");
        self.pending_failures = count;
    }

    /// Integrate state of charge and heatsink temperature over `dt`.
    pub fn step(&mut self, dt: Duration) {
        let mut remaining = dt;
        while !remaining.is_zero() {
            let h = remaining.min(MAX_SUBSTEP);
            remaining -= h;
            self.integrate(h);
            self.solve();
        }
    }

    fn integrate(&mut self, h: Duration) {
        let p = &self.params;
        let s = &mut self.state;
        let hours = h.as_secs_f64() / 3600.0;
        s.soc = (s.soc + s.battery_current * hours / p.battery_capacity_ah).clamp(0.0, 1.0);

        let panel_power = s.panel_voltage * s.panel_current;
        let dissipated = (1.0 - p.converter_efficiency) * panel_power;
        let settled = s.ambient_temperature + p.thermal_resistance * dissipated;
        let tau = p.thermal_time_constant.as_secs_f64().max(f64::EPSILON);
        let blend = (h.as_secs_f64() / tau).min(1.0);
        s.temperature += (settled - s.temperature) * blend;
    }

    /// Settle the electrical operating point for the present command.
    fn solve(&mut self) {
        let p = &self.params;
        let s = &mut self.state;
        let voc = if s.irradiance > 0.0 {
            (p.panel_voc + p.panel_thermal_voltage * s.irradiance.ln()).max(0.0)
        } else {
            0.0
        };
        let transferring = !self.command.panel_disconnect && !self.command.battery_disconnect;
        let duty = if transferring {
            f64::from(self.command.duty)
        } else {
            0.0
        };

        let ocv = p.open_circuit_voltage(s.soc);
        let resistance = p.internal_resistance(s.soc);
        let mut battery_current = -p.load_current;
        let mut battery_voltage = ocv;
        let mut panel_voltage = voc;
        let mut panel_current = 0.0;
        for _ in 0..SOLVER_ITERATIONS {
            battery_voltage = ocv + battery_current * resistance;
            panel_voltage = if duty > MIN_CONDUCTING_DUTY {
                (battery_voltage / duty).min(voc)
            } else {
                voc
            };
            panel_current = if panel_voltage < voc {
                let diode = ((panel_voltage - p.panel_voc) / p.panel_thermal_voltage).exp();
                (p.panel_isc * (s.irradiance - diode)).max(0.0)
            } else {
                0.0
            };
            let charge_current =
                p.converter_efficiency * panel_voltage * panel_current / battery_voltage.max(1.0);
            battery_current = charge_current - p.load_current;
        }

        s.battery_voltage = battery_voltage;
        s.battery_current = battery_current;
        s.panel_voltage = panel_voltage;
        s.panel_current = panel_current;
    }

    /// One acquisition as the ADCs would report it.
    pub fn sample(&mut self) -> Result<RawSample, SensorError> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(SensorError::Unavailable("simulated converter timeout".into()));
        }
        let s = self.state;
        let [current_offset, panel_offset, battery_offset] = self.offsets;
        let sample = RawSample {
            panel_voltage: self.counts(s.panel_voltage, Channel::PanelVoltage, panel_offset),
            panel_current: self.counts(s.panel_current, Channel::PanelCurrent, current_offset),
            battery_voltage: self.counts(s.battery_voltage, Channel::BatteryVoltage, battery_offset),
            battery_current: self.counts(s.battery_current, Channel::BatteryCurrent, current_offset),
            temperature: self.temperature_counts(s.temperature),
        };
        debug!(?sample, "simulated sample");
        Ok(sample)
    }

    /// What the ADCs report with every input disconnected.
    pub fn zero_sample(&mut self) -> RawSample {
        let [current_offset, panel_offset, battery_offset] = self.offsets;
        let ambient = self.state.ambient_temperature;
        RawSample {
            panel_voltage: self.counts(0.0, Channel::PanelVoltage, panel_offset),
            panel_current: self.counts(0.0, Channel::PanelCurrent, current_offset),
            battery_voltage: self.counts(0.0, Channel::BatteryVoltage, battery_offset),
            battery_current: self.counts(0.0, Channel::BatteryCurrent, current_offset),
            temperature: self.temperature_counts(ambient),
        }
    }

    fn noise(&mut self) -> f64 {
        self.noise.sample(&mut self.rng)
    }

    fn counts(&mut self, value: f64, channel: Channel, offset: f64) -> i16 {
        let ideal = f64::from(self.front_end.to_counts(value as f32, channel));
        let counts = (ideal + offset + self.noise()).round();
        counts.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }

    fn temperature_counts(&mut self, temperature: f64) -> u16 {
        let ideal = f64::from(
            self.front_end
                .to_counts(temperature as f32, Channel::Temperature),
        );
        (ideal + self.noise()).round().clamp(0.0, self.temperature_max_counts) as u16
    }
}

/// Shared access to one plant from the sensor and actuator adapters.
#[derive(Debug, Clone)]
pub struct PlantHandle {
    inner: Arc<Mutex<SolarPlant>>,
}

impl PlantHandle {
    pub fn new(plant: SolarPlant) -> Self {
        Self {
            inner: Arc::new(Mutex::new(plant)),
        }
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut SolarPlant) -> T) -> T {
        f(&mut self.inner.lock())
    }

    pub fn state(&self) -> PlantState {
        self.inner.lock().state()
    }

    pub fn sensor(&self) -> SimulatedSensor {
        SimulatedSensor {
            plant: self.clone(),
        }
    }

    pub fn actuator(&self) -> SimulatedActuator {
        SimulatedActuator {
            plant: self.clone(),
        }
    }

    pub fn zero_inputs(&self) -> ZeroInputSource {
        ZeroInputSource {
            plant: self.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    plant: PlantHandle,
}

impl SensorSource for SimulatedSensor {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        self.plant.with(SolarPlant::sample)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedActuator {
    plant: PlantHandle,
}

impl Actuator for SimulatedActuator {
    fn apply(&mut self, command: &ActuatorCommand) {
        self.plant.with(|plant| plant.apply(command));
    }
}

/// Calibration fixture: the plant's sensors with all inputs disconnected.
#[derive(Debug, Clone)]
pub struct ZeroInputSource {
    plant: PlantHandle,
}

impl SensorSource for ZeroInputSource {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        Ok(self.plant.with(SolarPlant::zero_sample))
    }
}
