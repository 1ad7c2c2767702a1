//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Signal conditioning: zero-offset calibration, unit conversion and
//! per-channel exponential smoothing.

use r_mppt_common::{FilterConfig, HardwareConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CalibrationError, SensorError};
use crate::interfaces::SensorSource;
use crate::reading::{Channel, ConditionedReading, RawSample, SignalClass};

/// Zero-input offsets in raw counts. Both current channels share one offset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationOffsets {
    pub current: f32,
    pub panel_voltage: f32,
    pub battery_voltage: f32,
}

impl CalibrationOffsets {
    pub fn for_channel(&self, channel: Channel) -> f32 {
        match channel {
            Channel::PanelVoltage => self.panel_voltage,
            Channel::BatteryVoltage => self.battery_voltage,
            Channel::PanelCurrent | Channel::BatteryCurrent => self.current,
            Channel::Temperature => 0.0,
        }
    }
}

/// Conversion between raw counts and physical units for the analog front end.
#[derive(Debug, Clone)]
pub struct AnalogFrontEnd {
    hardware: HardwareConfig,
}

impl AnalogFrontEnd {
    pub fn new(hardware: &HardwareConfig) -> Self {
        Self {
            hardware: hardware.clone(),
        }
    }

    /// Offset-corrected counts to volts, amperes or degrees Celsius.
    pub fn to_physical(&self, counts: f32, channel: Channel) -> f32 {
        let hw = &self.hardware;
        match channel.class() {
            SignalClass::Voltage => counts * hw.adc_scale_mv / 1000.0 * hw.voltage_divider_ratio,
            SignalClass::Current => counts * hw.adc_scale_mv / 1000.0 / hw.shunt_resistance_ohm,
            SignalClass::Temperature => {
                let volts = counts * hw.temperature_adc_reference / f32::from(hw.temperature_adc_max);
                volts * 1000.0 / hw.temperature_mv_per_degree
            }
        }
    }

    /// Inverse of [`AnalogFrontEnd::to_physical`], before offsets and rounding.
    pub fn to_counts(&self, value: f32, channel: Channel) -> f32 {
        let hw = &self.hardware;
        match channel.class() {
            SignalClass::Voltage => value / hw.voltage_divider_ratio * 1000.0 / hw.adc_scale_mv,
            SignalClass::Current => value * hw.shunt_resistance_ohm * 1000.0 / hw.adc_scale_mv,
            SignalClass::Temperature => {
                let volts = value * hw.temperature_mv_per_degree / 1000.0;
                volts / hw.temperature_adc_reference * f32::from(hw.temperature_adc_max)
            }
        }
    }

    /// Rail check: a converter pinned at its limit is treated as out of range.
    pub fn check_rails(&self, sample: &RawSample) -> Result<(), SensorError> {
        for channel in Channel::ALL {
            let raw = sample.get(channel);
            let pinned = match channel.class() {
                SignalClass::Temperature => raw >= i32::from(self.hardware.temperature_adc_max),
                _ => raw == i32::from(i16::MAX) || raw == i32::from(i16::MIN),
            };
            if pinned {
                return Err(SensorError::OutOfRange { channel, raw });
            }
        }
        Ok(())
    }
}

/// First-order low-pass filter seeded with the first sample it sees.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialFilter {
    alpha: f32,
    value: Option<f32>,
}

impl ExponentialFilter {
    pub fn new(alpha: f32) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f32) -> f32 {
        let next = match self.value {
            Some(previous) => previous * (1.0 - self.alpha) + sample * self.alpha,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

pub struct SignalConditioner {
    front_end: AnalogFrontEnd,
    max_offset: f32,
    offsets: Option<CalibrationOffsets>,
    filters: [ExponentialFilter; 5],
}

impl SignalConditioner {
    pub fn new(hardware: &HardwareConfig, filter: &FilterConfig, max_offset: f32) -> Self {
        let filters = Channel::ALL.map(|channel| {
            ExponentialFilter::new(match channel.class() {
                SignalClass::Voltage => filter.alpha_voltage,
                SignalClass::Current => filter.alpha_current,
                SignalClass::Temperature => filter.alpha_temperature,
            })
        });
        Self {
            front_end: AnalogFrontEnd::new(hardware),
            max_offset,
            offsets: None,
            filters,
        }
    }

    pub fn front_end(&self) -> &AnalogFrontEnd {
        &self.front_end
    }

    pub fn is_calibrated(&self) -> bool {
        self.offsets.is_some()
    }

    pub fn offsets(&self) -> Option<CalibrationOffsets> {
        self.offsets
    }

    /// Average `sample_count` zero-input samples into per-channel offsets.
    ///
    /// The caller guarantees the inputs are at zero. Running it twice against
    /// the same stream produces the same offsets; filters restart afterwards.
    pub fn calibrate<S>(
        &mut self,
        source: &mut S,
        sample_count: usize,
    ) -> Result<CalibrationOffsets, CalibrationError>
    where
        S: SensorSource + ?Sized,
    {
        if sample_count == 0 {
            return Err(CalibrationError::NoSamples);
        }

        let mut current = 0.0f64;
        let mut panel_voltage = 0.0f64;
        let mut battery_voltage = 0.0f64;
        for _ in 0..sample_count {
            let sample = source.read().map_err(CalibrationError::SourceUnavailable)?;
            current += f64::from(sample.panel_current);
            panel_voltage += f64::from(sample.panel_voltage);
            battery_voltage += f64::from(sample.battery_voltage);
        }

        let count = sample_count as f64;
        let offsets = CalibrationOffsets {
            current: (current / count) as f32,
            panel_voltage: (panel_voltage / count) as f32,
            battery_voltage: (battery_voltage / count) as f32,
        };

        for (channel, offset) in [
            (Channel::PanelCurrent, offsets.current),
            (Channel::PanelVoltage, offsets.panel_voltage),
            (Channel::BatteryVoltage, offsets.battery_voltage),
        ] {
            if !offset.is_finite() || offset.abs() > self.max_offset {
                return Err(CalibrationError::OffsetOutOfRange { channel, offset });
            }
        }

        self.offsets = Some(offsets);
        self.reset_filters();
        info!(
            samples = sample_count,
            current = offsets.current,
            panel_voltage = offsets.panel_voltage,
            battery_voltage = offsets.battery_voltage,
            "calibration complete"
        );
        Ok(offsets)
    }

    /// Trust the converters as-is, with zero offsets.
    pub fn skip_calibration(&mut self) {
        warn!("calibration skipped; using zero offsets");
        self.offsets = Some(CalibrationOffsets::default());
        self.reset_filters();
    }

    /// Convert one channel of a raw sample into physical units, unfiltered.
    pub fn condition(&self, raw: i32, channel: Channel) -> f32 {
        let offset = self
            .offsets
            .map(|offsets| offsets.for_channel(channel))
            .unwrap_or_default();
        self.front_end.to_physical(raw as f32 - offset, channel)
    }

    /// Convert, filter and store every channel of `sample` into `reading`.
    pub fn apply(
        &mut self,
        sample: &RawSample,
        reading: &mut ConditionedReading,
    ) -> Result<(), SensorError> {
        if self.offsets.is_none() {
            return Err(SensorError::Uncalibrated);
        }
        self.front_end.check_rails(sample)?;
        for channel in Channel::ALL {
            let value = self.condition(sample.get(channel), channel);
            let filtered = self.filters[channel.index()].update(value);
            reading.set(channel, filtered);
        }
        debug!(
            panel_voltage = reading.panel_voltage,
            battery_voltage = reading.battery_voltage,
            temperature = reading.temperature,
            "sample conditioned"
        );
        Ok(())
    }

    pub fn reset_filters(&mut self) {
        for filter in &mut self.filters {
            filter.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<RawSample>);

    impl SensorSource for Scripted {
        fn read(&mut self) -> Result<RawSample, SensorError> {
            self.0
                .pop_front()
                .ok_or_else(|| SensorError::Unavailable("script exhausted".into()))
        }
    }

    fn conditioner() -> SignalConditioner {
        SignalConditioner::new(&HardwareConfig::default(), &FilterConfig::default(), 800.0)
    }

    fn zero_stream(len: usize) -> Scripted {
        Scripted(
            (0..len)
                .map(|i| RawSample {
                    panel_voltage: 10 + (i % 3) as i16,
                    panel_current: -4 + (i % 2) as i16,
                    battery_voltage: 7,
                    battery_current: -4,
                    temperature: 0,
                })
                .collect(),
        )
    }

    #[test]
    fn conversion_matches_front_end_scaling() {
        let mut conditioner = conditioner();
        conditioner.skip_calibration();
        // 8000 counts * 0.125 mV = 1 V at the divider tap.
        assert!((conditioner.condition(8000, Channel::BatteryVoltage) - 5.11).abs() < 1e-4);
        // 400 counts = 50 mV across 10 mOhm.
        assert!((conditioner.condition(400, Channel::PanelCurrent) - 5.0).abs() < 1e-4);
        // 310 of 4095 at 3.3 V is 0.2498 V, 24.98 C for 10 mV/C.
        assert!((conditioner.condition(310, Channel::Temperature) - 24.98).abs() < 0.01);
    }

    #[test]
    fn front_end_inverts_its_own_scaling() {
        let front_end = AnalogFrontEnd::new(&HardwareConfig::default());
        for channel in Channel::ALL {
            let counts = front_end.to_counts(12.5, channel);
            assert!((front_end.to_physical(counts, channel) - 12.5).abs() < 1e-3);
        }
    }

    #[test]
    fn calibration_is_idempotent_for_the_same_stream() {
        let mut conditioner = conditioner();
        let first = conditioner.calibrate(&mut zero_stream(100), 100).unwrap();
        let second = conditioner.calibrate(&mut zero_stream(100), 100).unwrap();
        assert_eq!(first, second);
        assert!((first.battery_voltage - 7.0).abs() < f32::EPSILON);
        assert!((first.current + 3.5).abs() < f32::EPSILON);
    }

    #[test]
    fn calibration_fails_when_source_runs_dry() {
        let mut conditioner = conditioner();
        let err = conditioner.calibrate(&mut zero_stream(10), 100).unwrap_err();
        assert!(matches!(err, CalibrationError::SourceUnavailable(_)));
        assert!(!conditioner.is_calibrated());
    }

    #[test]
    fn calibration_rejects_live_inputs() {
        let mut conditioner = conditioner();
        let mut live = Scripted(
            std::iter::repeat(RawSample {
                battery_voltage: 20_000,
                ..RawSample::default()
            })
            .take(5)
            .collect(),
        );
        let err = conditioner.calibrate(&mut live, 5).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::OffsetOutOfRange {
                channel: Channel::BatteryVoltage,
                ..
            }
        ));
    }

    #[test]
    fn apply_requires_calibration() {
        let mut conditioner = conditioner();
        let mut reading = ConditionedReading::default();
        assert_eq!(
            conditioner.apply(&RawSample::default(), &mut reading),
            Err(SensorError::Uncalibrated)
        );
    }

    #[test]
    fn filter_converges_on_constant_input() {
        let mut conditioner = conditioner();
        conditioner.skip_calibration();
        let mut reading = ConditionedReading::default();
        let start = RawSample::shared_shunt(16_000, 0, 16_000, 310);
        conditioner.apply(&start, &mut reading).unwrap();
        assert!((reading.battery_voltage - 10.22).abs() < 1e-3, "seeded by first sample");

        let target = RawSample::shared_shunt(20_000, 200, 20_000, 400);
        let expected = conditioner.condition(20_000, Channel::BatteryVoltage);
        let step = expected - reading.battery_voltage;
        let alpha = FilterConfig::default().alpha_voltage;
        for n in 1..=120 {
            conditioner.apply(&target, &mut reading).unwrap();
            let bound = step.abs() * (1.0 - alpha).powi(n) + 1e-3;
            assert!((reading.battery_voltage - expected).abs() <= bound);
        }
        assert!((reading.battery_voltage - expected).abs() < 0.01);
        assert!((reading.battery_current - 2.5).abs() < 0.01);
    }

    #[test]
    fn pinned_converter_is_out_of_range() {
        let mut conditioner = conditioner();
        conditioner.skip_calibration();
        let mut reading = ConditionedReading::default();
        let pinned = RawSample::shared_shunt(i16::MAX, 0, 16_000, 310);
        assert_eq!(
            conditioner.apply(&pinned, &mut reading),
            Err(SensorError::OutOfRange {
                channel: Channel::PanelVoltage,
                raw: i32::from(i16::MAX)
            })
        );
        assert_eq!(reading, ConditionedReading::default());
    }
}
