//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Shared primitives and utilities for the control runtime."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Core shared primitives for the R-MPPT charge controller workspace.
//! This crate exposes configuration loading, logging, and time helpers
//! consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, BatteryConfig, BatteryProfileConfig, BatteryType, ChargeConfig, ControllerConfig,
    FilterConfig, HardwareConfig, LoggingConfig, ProtectionConfig, SimulationConfig,
    TrackerConfig,
};
pub use logging::{init_test_tracing, init_tracing, LogFormat};
