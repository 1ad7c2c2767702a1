//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Control core of the R-MPPT solar charge controller.
//!
//! One control cycle runs acquisition and conditioning, power estimation,
//! protection, MPPT tracking clamped by the charge phase controller, a single
//! actuator write, telemetry recording and finally the system state machine
//! evaluation for the next cycle. [`ControlCore`] owns all of it.

pub mod charge;
pub mod clock;
pub mod controller;
pub mod error;
pub mod interfaces;
pub mod power;
pub mod profile;
pub mod protection;
pub mod reading;
pub mod signal;
pub mod snapshot;
pub mod system;
pub mod telemetry;
pub mod tracker;

pub use charge::{ChargeController, ChargePhase, ChargeTarget, Regulation};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{ConfigUpdate, ControlCore, ControllerState, CycleReport};
pub use error::{CalibrationError, CoreError, DecodeError, Result, SensorError};
pub use interfaces::{Actuator, ActuatorCommand, DailyStatsSink, SensorSource, TracingStatsSink};
pub use profile::{BatteryProfile, ProfileCatalog};
pub use protection::{ErrorFlags, ProtectionDecision, ProtectionState, ProtectionSupervisor};
pub use reading::{Channel, ConditionedReading, RawSample};
pub use signal::{AnalogFrontEnd, CalibrationOffsets, SignalConditioner};
pub use snapshot::{ControllerSnapshot, SnapshotPublisher};
pub use system::{SystemState, SystemStateMachine};
pub use telemetry::{DailyStats, TelemetryHistory, TelemetryRecord, TelemetryRecorder};
pub use tracker::{MpptState, MpptTracker};
