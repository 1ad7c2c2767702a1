//! ---
//! mppt_section: "11-simulation"
//! mppt_subsection: "01-bootstrap"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Simulation runtime module exports and shared types."
//! mppt_version: "v0.1.0"
//! mppt_owner: "tbd"
//! ---
//! Simulated solar plant for running the R-MPPT control core without hardware.
//!
//! The plant models a PV panel, the buck converter, a lead-acid style battery
//! and the heatsink. It exposes the same sensor and actuator seams the control
//! core uses on real hardware.

pub mod clock;
pub mod plant;
pub mod scenario;

pub use clock::SimulatedClock;
pub use plant::{
    PlantHandle, PlantParameters, PlantState, SimulatedActuator, SimulatedSensor, SolarPlant,
    ZeroInputSource,
};
pub use scenario::{IrradianceProfile, Scenario, ScenarioStep, SunPosition};

use std::time::Duration;

use anyhow::{Context, Result};
use r_mppt_common::AppConfig;
use tracing::info;

/// Plant plus its irradiance source, stepped in simulated time.
#[derive(Debug)]
pub struct Simulation {
    plant: PlantHandle,
    profile: IrradianceProfile,
    last: Duration,
}

impl Simulation {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let sim = &config.simulation;
        let profile = match (&sim.scenario_file, sim.constant_irradiance) {
            (Some(path), _) => IrradianceProfile::Scenario(
                Scenario::from_path(path)
                    .with_context(|| format!("unable to load scenario {}", path.display()))?,
            ),
            (None, Some(irradiance)) => IrradianceProfile::Constant(irradiance),
            (None, None) => IrradianceProfile::Diurnal(SunPosition::starting_at(sim.start_hour)),
        };
        let plant = SolarPlant::new(
            PlantParameters::from_config(sim),
            &config.hardware,
            sim.random_seed,
            sim.noise_sigma,
        )?;
        info!(profile = profile.describe(), seed = sim.random_seed, "simulated plant ready");
        Ok(Self {
            plant: PlantHandle::new(plant),
            profile,
            last: Duration::ZERO,
        })
    }

    pub fn handle(&self) -> PlantHandle {
        self.plant.clone()
    }

    /// Integrate the plant up to simulated time `now`.
    pub fn advance(&mut self, now: Duration) {
        let dt = now.saturating_sub(self.last);
        self.last = now;
        let conditions = self.profile.at(now);
        self.plant.with(|plant| {
            plant.set_conditions(conditions.irradiance, conditions.ambient_temperature);
            plant.step(dt);
        });
    }

    pub fn state(&self) -> PlantState {
        self.plant.state()
    }
}
