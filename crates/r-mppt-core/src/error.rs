//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use std::time::Duration;

use thiserror::Error;

use crate::reading::Channel;
use crate::system::SystemState;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("sensor fault: {0}")]
    Sensor(#[from] SensorError),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("operation not permitted in the {0} state")]
    InvalidState(SystemState),
}

/// Start-up calibration failures. Fatal until resolved; the controller stays in Init.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("calibration requires at least one sample")]
    NoSamples,
    #[error("sample source unavailable: {0}")]
    SourceUnavailable(#[source] SensorError),
    #[error("{channel} offset {offset:.1} counts exceeds the accepted zero-input range")]
    OffsetOutOfRange { channel: Channel, offset: f32 },
}

/// Mid-run acquisition failures, routed through the protection supervisor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error("sensor unavailable: {0}")]
    Unavailable(String),
    #[error("sample arrived after {elapsed:?}, beyond the cycle budget")]
    Stale { elapsed: Duration },
    #[error("{channel} reading {raw} is pinned at the converter rail")]
    OutOfRange { channel: Channel, raw: i32 },
    #[error("signal conditioner has not been calibrated")]
    Uncalibrated,
}

/// Failures while parsing exported telemetry frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("telemetry frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown charge phase code {0}")]
    UnknownPhase(u8),
    #[error("unknown system state code {0}")]
    UnknownState(u8),
}
