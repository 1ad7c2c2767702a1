//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! The control cycle driver.
//!
//! [`ControlCore::cycle`] runs one fixed-order pass:
//!
//! 1. acquire and condition a sample (a late or failed read holds the last reading)
//! 2. power and efficiency
//! 3. protection evaluation
//! 4. while charging: charge phase update, MPPT step, ceiling clamp
//! 5. protection override of the command
//! 6. the single actuator write
//! 7. telemetry record and daily statistics
//! 8. system state machine evaluation for the next cycle
//! 9. snapshot publication

use std::time::Duration;

use chrono::NaiveDate;
use r_mppt_common::time::duration_to_millis;
use r_mppt_common::{AppConfig, BatteryConfig, ControllerConfig, ProtectionConfig};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::charge::{ChargeController, ChargeInputs, ChargePhase, Regulation};
use crate::clock::Clock;
use crate::error::{CoreError, Result, SensorError};
use crate::interfaces::{Actuator, ActuatorCommand, DailyStatsSink, SensorSource, TracingStatsSink};
use crate::power;
use crate::profile::{BatteryProfile, ProfileCatalog};
use crate::protection::{
    ErrorFlags, ProtectionDecision, ProtectionState, ProtectionSupervisor, SensorStatus,
};
use crate::reading::ConditionedReading;
use crate::signal::{CalibrationOffsets, SignalConditioner};
use crate::snapshot::{ControllerSnapshot, SnapshotPublisher};
use crate::system::{SystemInputs, SystemRequests, SystemState, SystemStateMachine, SystemTransition};
use crate::telemetry::{DailyStats, TelemetryHistory, TelemetryRecord, TelemetryRecorder};
use crate::tracker::{MpptState, MpptTracker};

/// Everything a cycle produces, in one place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControllerState {
    pub cycle: u64,
    pub reading: ConditionedReading,
    pub mppt_state: MpptState,
    pub charge_phase: ChargePhase,
    pub regulation: Regulation,
    pub protection_state: ProtectionState,
    pub system_state: SystemState,
    pub command: ActuatorCommand,
    pub error_flags: ErrorFlags,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            cycle: 0,
            reading: ConditionedReading::default(),
            mppt_state: MpptState::Scanning,
            charge_phase: ChargePhase::Off,
            regulation: Regulation::Off,
            protection_state: ProtectionState::Normal,
            system_state: SystemState::Init,
            command: ActuatorCommand::safe(),
            error_flags: ErrorFlags::empty(),
        }
    }
}

/// Changes accepted while the controller is in the config state.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub battery: Option<BatteryConfig>,
    pub protection: Option<ProtectionConfig>,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub command: ActuatorCommand,
    pub protection: ProtectionState,
    pub system_state: SystemState,
    pub transition: Option<SystemTransition>,
    pub finished_day: Option<DailyStats>,
}

pub struct ControlCore {
    settings: ControllerConfig,
    pwm_max_counts: u16,
    catalog: ProfileCatalog,
    conditioner: SignalConditioner,
    tracker: MpptTracker,
    charge: ChargeController,
    protection: ProtectionSupervisor,
    system: SystemStateMachine,
    recorder: TelemetryRecorder,
    state: ControllerState,
    requests: SystemRequests,
    stats_sink: Box<dyn DailyStatsSink + Send>,
    publisher: Option<SnapshotPublisher>,
    last_cycle_at: Option<Duration>,
    panel_seen_at: Duration,
    charging_cycles: u32,
    charge_retry_at: Option<Duration>,
}

impl ControlCore {
    pub fn new(config: &AppConfig, today: NaiveDate) -> Result<Self> {
        config
            .validate()
            .map_err(|err| CoreError::Configuration(format!("{err:#}")))?;
        let catalog = ProfileCatalog::from_config(&config.battery, &config.protection)?;
        let settings = config.controller.clone();
        Ok(Self {
            pwm_max_counts: config.hardware.pwm_max_counts(),
            catalog,
            conditioner: SignalConditioner::new(
                &config.hardware,
                &config.filter,
                settings.max_calibration_offset,
            ),
            tracker: MpptTracker::new(&config.tracker),
            charge: ChargeController::new(&config.charge),
            protection: ProtectionSupervisor::new(&config.protection, settings.sensor_fault_cycles),
            system: SystemStateMachine::new(settings.sleep_after),
            recorder: TelemetryRecorder::new(settings.history_capacity, today),
            state: ControllerState::default(),
            requests: SystemRequests::default(),
            stats_sink: Box::new(TracingStatsSink),
            publisher: None,
            last_cycle_at: None,
            panel_seen_at: Duration::ZERO,
            charging_cycles: 0,
            charge_retry_at: None,
            settings,
        })
    }

    pub fn with_stats_sink(mut self, sink: Box<dyn DailyStatsSink + Send>) -> Self {
        self.stats_sink = sink;
        self
    }

    pub fn with_publisher(mut self, publisher: SnapshotPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn system_state(&self) -> SystemState {
        self.system.state()
    }

    pub fn protection_state(&self) -> ProtectionState {
        self.protection.state()
    }

    pub fn profile(&self) -> &BatteryProfile {
        self.catalog.current()
    }

    pub fn catalog(&self) -> &ProfileCatalog {
        &self.catalog
    }

    pub fn protection_limits(&self) -> &ProtectionConfig {
        self.protection.limits()
    }

    pub fn offsets(&self) -> Option<CalibrationOffsets> {
        self.conditioner.offsets()
    }

    pub fn history(&self) -> &TelemetryHistory {
        self.recorder.history()
    }

    pub fn daily_stats(&self) -> &DailyStats {
        self.recorder.today()
    }

    /// Calibrate the signal conditioner and move Init to SelfTest.
    ///
    /// `zero_inputs` must present zero panel and battery inputs for the whole
    /// calibration window. A failure leaves the controller in Init with safe
    /// outputs.
    pub fn initialize<S>(&mut self, zero_inputs: &mut S) -> Result<CalibrationOffsets>
    where
        S: SensorSource + ?Sized,
    {
        let state = self.system.state();
        if state != SystemState::Init {
            return Err(CoreError::InvalidState(state));
        }
        let offsets = if self.settings.skip_calibration {
            self.conditioner.skip_calibration();
            CalibrationOffsets::default()
        } else {
            match self
                .conditioner
                .calibrate(zero_inputs, self.settings.calibration_samples)
            {
                Ok(offsets) => offsets,
                Err(err) => {
                    error!(error = %err, "calibration failed; staying in init");
                    return Err(err.into());
                }
            }
        };
        let inputs = SystemInputs {
            calibrated: true,
            self_test: None,
            panel_available: false,
            protection: self.protection.state(),
            inactive_for: Duration::ZERO,
            requests: SystemRequests::default(),
        };
        self.advance_system(inputs);
        Ok(offsets)
    }

    /// Run one control cycle and write the actuator exactly once.
    pub fn cycle<S, A, C>(&mut self, sensor: &mut S, actuator: &mut A, clock: &C) -> CycleReport
    where
        S: SensorSource + ?Sized,
        A: Actuator + ?Sized,
        C: Clock + ?Sized,
    {
        let now = clock.monotonic();
        let elapsed = self
            .last_cycle_at
            .map_or(Duration::ZERO, |at| now.saturating_sub(at));
        self.last_cycle_at = Some(now);
        self.state.cycle += 1;
        let system_state = self.system.state();

        let sensor_status = self.acquire(sensor, clock);
        power::update(&mut self.state.reading);

        let calibrated = self.conditioner.is_calibrated();
        let decision: Option<ProtectionDecision> = if calibrated {
            Some(
                self.protection
                    .evaluate(&self.state.reading, sensor_status, now),
            )
        } else {
            None
        };
        let protection_state = decision.map_or(ProtectionState::Normal, |d| d.state);

        let mut command = match system_state {
            SystemState::Init => ActuatorCommand::safe(),
            _ => ActuatorCommand::idle(),
        };
        let mut regulation = Regulation::Off;
        if system_state == SystemState::Charging {
            let (duty, mode) = self.charge_step(protection_state, now);
            command.set_duty(duty, self.pwm_max_counts);
            regulation = mode;
        } else {
            self.charge.force_off(now);
        }

        // Protection has the last word on the outputs.
        if let Some(decision) = &decision {
            decision.apply(&mut command, self.pwm_max_counts);
            if decision.state >= ProtectionState::Fault {
                regulation = Regulation::Off;
            }
        }
        if system_state == SystemState::Charging {
            self.tracker.constrain(command.duty);
        }
        actuator.apply(&command);

        let flags = decision.map_or(ErrorFlags::empty(), |d| d.flags);
        self.state.command = command;
        self.state.regulation = regulation;
        self.state.mppt_state = self.tracker.state();
        self.state.charge_phase = self.charge.phase();
        self.state.protection_state = protection_state;
        self.state.error_flags = flags;
        self.state.system_state = system_state;

        let record = TelemetryRecord::new(
            duration_to_millis(now),
            &self.state.reading,
            command.duty,
            self.charge.phase(),
            system_state,
            flags,
        );
        let finished_day = self.recorder.record(record, clock.today(), elapsed);
        if let Some(day) = &finished_day {
            self.stats_sink.persist(day);
        }

        let panel_available = self.panel_available();
        if panel_available {
            self.panel_seen_at = now;
        }
        if system_state == SystemState::Charging {
            self.charging_cycles = self.charging_cycles.saturating_add(1);
        }
        let self_test = (system_state == SystemState::SelfTest)
            .then(|| self.self_test(sensor_status));
        let retry_ready = self.charge_retry_at.map_or(true, |at| now >= at);
        let inputs = SystemInputs {
            calibrated,
            self_test,
            panel_available: panel_available && retry_ready,
            protection: protection_state,
            inactive_for: now.saturating_sub(self.panel_seen_at),
            requests: std::mem::take(&mut self.requests),
        };
        let transition = self.advance_system(inputs);
        self.state.system_state = self.system.state();

        debug!(
            cycle = self.state.cycle,
            state = %self.state.system_state,
            phase = %self.state.charge_phase,
            duty = command.duty,
            panel_power = self.state.reading.panel_power,
            "cycle complete"
        );
        self.publish();

        CycleReport {
            cycle: self.state.cycle,
            command,
            protection: protection_state,
            system_state: self.state.system_state,
            transition,
            finished_day,
        }
    }

    /// Release a latched emergency or failed self-test. Conditions that are
    /// still present trip again on the next cycle.
    pub fn request_fault_clear(&mut self) {
        info!("fault clear requested");
        self.protection.clear_fault();
        self.requests.fault_clear = true;
    }

    pub fn request_sleep(&mut self) {
        self.requests.sleep = true;
    }

    pub fn request_wake(&mut self) {
        self.requests.wake = true;
    }

    /// Enter the config state at the end of the next cycle.
    pub fn enter_config(&mut self) {
        self.requests.enter_config = true;
    }

    /// Leave the config state at the end of the next cycle.
    pub fn exit_config(&mut self) {
        self.requests.exit_config = true;
    }

    /// Validate and apply a configuration change atomically. On error the
    /// previous configuration stays in force.
    pub fn apply_config(&mut self, update: ConfigUpdate) -> Result<()> {
        let state = self.system.state();
        if state != SystemState::Config {
            return Err(CoreError::InvalidState(state));
        }
        let limits = update
            .protection
            .unwrap_or_else(|| self.protection.limits().clone());
        limits
            .validate()
            .map_err(|err| CoreError::Configuration(format!("{err:#}")))?;
        let catalog = match &update.battery {
            Some(battery) => ProfileCatalog::from_config(battery, &limits)?,
            None => {
                self.catalog.validate(&limits)?;
                self.catalog.clone()
            }
        };

        self.protection.set_limits(&limits);
        self.catalog = catalog;
        self.charge.force_off(self.last_cycle_at.unwrap_or_default());
        info!(
            battery = %self.catalog.selected(),
            profile = %self.catalog.current().name,
            "configuration applied"
        );
        Ok(())
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            state: self.state,
            battery: self.catalog.current().name.clone(),
            daily: self.recorder.today().clone(),
            history_len: self.recorder.history().len(),
            captured_at_ms: duration_to_millis(self.last_cycle_at.unwrap_or_default()),
        }
    }

    fn publish(&self) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(self.snapshot());
        }
    }

    fn acquire<S, C>(&mut self, sensor: &mut S, clock: &C) -> SensorStatus
    where
        S: SensorSource + ?Sized,
        C: Clock + ?Sized,
    {
        if !self.conditioner.is_calibrated() {
            return SensorStatus::Fresh;
        }
        let budget = self.settings.cycle_budget;
        let started = clock.monotonic();
        let result = sensor
            .read()
            .and_then(|sample| {
                let elapsed = clock.monotonic().saturating_sub(started);
                if elapsed > budget {
                    Err(SensorError::Stale { elapsed })
                } else {
                    Ok(sample)
                }
            })
            .and_then(|sample| self.conditioner.apply(&sample, &mut self.state.reading));
        match result {
            Ok(()) => SensorStatus::Fresh,
            Err(err @ SensorError::OutOfRange { .. }) => {
                warn!(error = %err, "sensor sample rejected");
                SensorStatus::OutOfRange
            }
            Err(err) => {
                warn!(error = %err, "sensor sample missing; holding last reading");
                SensorStatus::Missing
            }
        }
    }

    fn charge_step(&mut self, protection: ProtectionState, now: Duration) -> (f32, Regulation) {
        let reading = self.state.reading;
        let profile = self.catalog.current();
        let max_current = profile
            .max_charge_current
            .min(self.protection.limits().max_charge_current);
        let inputs = ChargeInputs {
            panel_available: true,
            protection,
            battery_voltage: reading.battery_voltage,
            battery_current: reading.battery_current,
            now,
        };
        if let Some(change) = self.charge.update(profile, &inputs, max_current) {
            if change.to == ChargePhase::Bulk {
                self.recorder.note_charge_cycle();
            }
        }
        if self.charge.phase() == ChargePhase::Off {
            return (0.0, Regulation::Off);
        }
        let proposed = self.tracker.update(reading.panel_power);
        let target = self.charge.target(profile, max_current);
        self.charge
            .regulate(&target, proposed, self.state.command.duty, &reading)
    }

    /// Whether the panel can support charging. Starting needs headroom over the
    /// battery; once charging, only a starved bulk phase (after the grace
    /// period and outside the tracker's sweep) or a collapsed panel voltage
    /// stops it.
    fn panel_available(&self) -> bool {
        let reading = &self.state.reading;
        let limits = self.protection.limits();
        let voltage_ok = reading.panel_voltage >= limits.panel_voltage_min;
        if self.system.state() == SystemState::Charging {
            let starved = self.charging_cycles >= self.settings.charge_grace_cycles
                && self.charge.phase() == ChargePhase::Bulk
                && self.tracker.state() != MpptState::Scanning
                && reading.panel_power < self.settings.charge_stop_power;
            voltage_ok && !starved
        } else {
            voltage_ok && reading.panel_voltage >= reading.battery_voltage + self.settings.panel_headroom
        }
    }

    fn self_test(&self, sensor: SensorStatus) -> bool {
        let reading = &self.state.reading;
        let s = &self.settings;
        let checks = [
            ("sensor acquisition", sensor == SensorStatus::Fresh),
            (
                "temperature plausible",
                (s.self_test_min_temperature..=s.self_test_max_temperature)
                    .contains(&reading.temperature),
            ),
            (
                "battery voltage plausible",
                reading.battery_voltage >= -s.self_test_voltage_tolerance,
            ),
            (
                "panel voltage plausible",
                reading.panel_voltage >= -s.self_test_voltage_tolerance,
            ),
        ];
        let mut passed = true;
        for (check, ok) in checks {
            if !ok {
                error!(check, ?reading, "self-test check failed");
                passed = false;
            }
        }
        if passed {
            info!("self-test passed");
        }
        passed
    }

    fn advance_system(&mut self, inputs: SystemInputs) -> Option<SystemTransition> {
        let transition = self.system.advance(&inputs)?;
        let now = self.last_cycle_at.unwrap_or_default();
        if transition.to == SystemState::Charging {
            self.tracker.reset();
            self.charging_cycles = 0;
            self.charge_retry_at = None;
        }
        if transition.from == SystemState::Charging {
            self.charge.force_off(now);
        }
        if transition.from == SystemState::Charging && transition.to == SystemState::Idle {
            let retry_at = now + self.settings.charge_retry_delay;
            info!(retry_in_s = self.settings.charge_retry_delay.as_secs(), "charging stopped");
            self.charge_retry_at = Some(retry_at);
        }
        if transition.to == SystemState::Fault && self.system.self_test_failed() {
            warn!("outputs held safe until the fault is cleared");
        }
        Some(transition)
    }
}
