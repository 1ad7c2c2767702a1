//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::Mutex;
use r_mppt_common::{
    init_test_tracing, AppConfig, BatteryConfig, BatteryProfileConfig, BatteryType, HardwareConfig,
};
use r_mppt_core::{
    Actuator, ActuatorCommand, AnalogFrontEnd, Channel, ChargePhase, Clock, ConfigUpdate, ControlCore,
    CoreError, DailyStats, DailyStatsSink, ErrorFlags, ManualClock, ProtectionState, RawSample,
    Regulation, SensorError, SensorSource, SnapshotPublisher, SystemState,
};

const TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
struct Physical {
    panel_voltage: f32,
    panel_current: f32,
    battery_voltage: f32,
    battery_current: f32,
    temperature: f32,
}

impl Physical {
    fn sunrise() -> Self {
        Self {
            panel_voltage: 18.0,
            panel_current: 0.0,
            battery_voltage: 12.8,
            battery_current: 0.0,
            temperature: 25.0,
        }
    }
}

/// Bench sensor producing raw counts for the configured physical values.
struct Bench {
    front_end: AnalogFrontEnd,
    physical: Physical,
    failing: bool,
}

impl Bench {
    fn new(physical: Physical) -> Self {
        Self {
            front_end: AnalogFrontEnd::new(&HardwareConfig::default()),
            physical,
            failing: false,
        }
    }

    fn counts(&self, value: f32, channel: Channel) -> f32 {
        self.front_end.to_counts(value, channel).round()
    }
}

impl SensorSource for Bench {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        if self.failing {
            return Err(SensorError::Unavailable("bench disconnected".into()));
        }
        let p = self.physical;
        Ok(RawSample {
            panel_voltage: self.counts(p.panel_voltage, Channel::PanelVoltage) as i16,
            panel_current: self.counts(p.panel_current, Channel::PanelCurrent) as i16,
            battery_voltage: self.counts(p.battery_voltage, Channel::BatteryVoltage) as i16,
            battery_current: self.counts(p.battery_current, Channel::BatteryCurrent) as i16,
            temperature: self.counts(p.temperature, Channel::Temperature) as u16,
        })
    }
}

struct ZeroInputs;

impl SensorSource for ZeroInputs {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        Ok(RawSample::default())
    }
}

#[derive(Default)]
struct Outputs {
    writes: Vec<ActuatorCommand>,
}

impl Actuator for Outputs {
    fn apply(&mut self, command: &ActuatorCommand) {
        self.writes.push(*command);
    }
}

#[derive(Clone, Default)]
struct CollectingSink(Arc<Mutex<Vec<DailyStats>>>);

impl DailyStatsSink for CollectingSink {
    fn persist(&mut self, stats: &DailyStats) {
        self.0.lock().push(stats.clone());
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
}

/// Clock that moves on by `stall` every time it is read, like a sensor bus
/// that blocks the loop between two timestamps.
#[derive(Default)]
struct StallingClock {
    now: Cell<Duration>,
    stall: Cell<Duration>,
}

impl Clock for StallingClock {
    fn monotonic(&self) -> Duration {
        let now = self.now.get();
        self.now.set(now + self.stall.get());
        now
    }

    fn today(&self) -> NaiveDate {
        day(1)
    }
}

struct Rig {
    core: ControlCore,
    bench: Bench,
    outputs: Outputs,
    clock: ManualClock,
}

impl Rig {
    fn new(config: &AppConfig, physical: Physical) -> Self {
        init_test_tracing();
        Self {
            core: ControlCore::new(config, day(1)).unwrap(),
            bench: Bench::new(physical),
            outputs: Outputs::default(),
            clock: ManualClock::new(day(1)),
        }
    }

    fn started(physical: Physical) -> Self {
        let mut rig = Self::new(&AppConfig::default(), physical);
        rig.core.initialize(&mut ZeroInputs).unwrap();
        rig
    }

    fn step(&mut self) -> r_mppt_core::CycleReport {
        self.clock.advance(TICK);
        self.core.cycle(&mut self.bench, &mut self.outputs, &self.clock)
    }

    fn run(&mut self, cycles: usize) {
        for _ in 0..cycles {
            self.step();
        }
    }
}

#[test]
fn starts_up_and_begins_charging() {
    let mut rig = Rig::new(&AppConfig::default(), Physical::sunrise());
    assert_eq!(rig.core.system_state(), SystemState::Init);

    let report = rig.step();
    assert_eq!(report.command, ActuatorCommand::safe(), "uncalibrated outputs stay safe");

    let offsets = rig.core.initialize(&mut ZeroInputs).unwrap();
    assert_eq!(offsets.battery_voltage, 0.0);
    assert_eq!(rig.core.system_state(), SystemState::SelfTest);

    rig.step();
    assert_eq!(rig.core.system_state(), SystemState::Idle);
    rig.step();
    assert_eq!(rig.core.system_state(), SystemState::Charging);

    let report = rig.step();
    assert_eq!(rig.core.state().charge_phase, ChargePhase::Bulk);
    assert!(report.command.duty > 0.0);
    assert!(!report.command.battery_disconnect && !report.command.panel_disconnect);
    assert_eq!(rig.outputs.writes.len(), 4, "exactly one actuator write per cycle");
    assert_eq!(rig.core.daily_stats().charge_cycles, 1);
}

#[test]
fn calibration_failure_keeps_init_and_safe_outputs() {
    let mut rig = Rig::new(&AppConfig::default(), Physical::sunrise());
    rig.bench.failing = true;
    let err = rig.core.initialize(&mut rig.bench).unwrap_err();
    assert!(matches!(err, CoreError::Calibration(_)));
    assert_eq!(rig.core.system_state(), SystemState::Init);
    rig.bench.failing = false;
    let report = rig.step();
    assert_eq!(report.command, ActuatorCommand::safe());
    assert_eq!(rig.core.system_state(), SystemState::Init);
}

#[test]
fn over_voltage_emergency_is_sticky_until_cleared() {
    let mut rig = Rig::started(Physical {
        battery_voltage: 15.2,
        ..Physical::sunrise()
    });
    let report = rig.step();
    assert_eq!(report.protection, ProtectionState::Emergency);
    assert_eq!(report.command.pwm_counts, 0);
    assert!(report.command.panel_disconnect && report.command.battery_disconnect);
    assert!(rig.core.state().error_flags.contains(ErrorFlags::OVER_VOLTAGE));

    rig.bench.physical.battery_voltage = 13.0;
    for _ in 0..150 {
        let report = rig.step();
        assert_eq!(report.protection, ProtectionState::Emergency);
        assert_eq!(report.command.duty, 0.0);
        assert!(report.command.panel_disconnect && report.command.battery_disconnect);
    }
    assert_eq!(rig.core.system_state(), SystemState::Fault);

    rig.core.request_fault_clear();
    let report = rig.step();
    assert_eq!(report.protection, ProtectionState::Normal);
    assert_eq!(rig.core.system_state(), SystemState::Idle);
}

#[test]
fn missing_samples_escalate_to_fault() {
    let mut rig = Rig::started(Physical::sunrise());
    rig.run(2);
    rig.bench.failing = true;
    let first = rig.step();
    assert_eq!(first.protection, ProtectionState::Warning);
    assert!(rig.core.state().error_flags.contains(ErrorFlags::SENSOR));
    rig.step();
    let third = rig.step();
    assert_eq!(third.protection, ProtectionState::Fault);
    assert!(third.command.battery_disconnect);
    assert_eq!(third.command.duty, 0.0);
    assert_eq!(rig.core.system_state(), SystemState::Fault);
}

#[test]
fn stale_samples_escalate_to_fault() {
    init_test_tracing();
    let config = AppConfig::default();
    let mut core = ControlCore::new(&config, day(1)).unwrap();
    core.initialize(&mut ZeroInputs).unwrap();
    let mut bench = Bench::new(Physical::sunrise());
    let mut outputs = Outputs::default();
    let clock = StallingClock::default();
    let mut step = |core: &mut ControlCore| {
        clock.now.set(clock.now.get() + TICK);
        core.cycle(&mut bench, &mut outputs, &clock)
    };

    for _ in 0..2 {
        assert_eq!(step(&mut core).protection, ProtectionState::Normal);
    }
    clock.stall.set(config.controller.cycle_budget + Duration::from_millis(1));
    let first = step(&mut core);
    assert_eq!(first.protection, ProtectionState::Warning);
    assert!(core.state().error_flags.contains(ErrorFlags::SENSOR));
    let second = step(&mut core);
    assert_eq!(second.protection, ProtectionState::Warning);
    let third = step(&mut core);
    assert_eq!(third.protection, ProtectionState::Fault);
    assert!(third.command.battery_disconnect);
    assert_eq!(third.command.duty, 0.0);
    assert_eq!(core.system_state(), SystemState::Fault);
}

#[test]
fn starved_charging_waits_before_retrying() {
    let config = AppConfig::default();
    let mut rig = Rig::started(Physical::sunrise());
    rig.run(2);
    assert_eq!(rig.core.system_state(), SystemState::Charging);

    // No panel current: the sweep runs to completion before charging gives up.
    let mut charging = 0;
    while rig.core.system_state() == SystemState::Charging && charging < 1000 {
        rig.step();
        charging += 1;
    }
    assert_eq!(rig.core.system_state(), SystemState::Idle);
    assert!(charging > 5 * config.controller.charge_grace_cycles, "gave up after {charging} cycles");

    // The panel still has headroom, yet the retry waits out the delay.
    let delay = (config.controller.charge_retry_delay.as_millis() / TICK.as_millis()) as usize;
    for _ in 1..delay {
        rig.step();
        assert_eq!(rig.core.system_state(), SystemState::Idle);
    }
    rig.step();
    assert_eq!(rig.core.system_state(), SystemState::Charging);
}

#[test]
fn voltage_ceiling_overrides_tracker() {
    let mut rig = Rig::started(Physical {
        battery_voltage: 14.6,
        panel_current: 3.0,
        battery_current: 3.5,
        ..Physical::sunrise()
    });
    rig.bench.physical.panel_voltage = 19.0;
    rig.run(3);
    assert_eq!(rig.core.system_state(), SystemState::Charging);

    let mut previous = f32::MAX;
    for _ in 0..20 {
        let report = rig.step();
        assert_eq!(rig.core.state().charge_phase, ChargePhase::Float);
        assert_eq!(rig.core.state().regulation, Regulation::ConstantVoltage);
        assert!(report.command.duty <= previous);
        previous = report.command.duty;
    }
    assert_eq!(previous, 0.0);
}

#[test]
fn config_changes_are_atomic_and_state_bound() {
    let mut rig = Rig::started(Physical::sunrise());
    rig.run(2);
    let previous = rig.core.system_state();

    let lifepo4 = ConfigUpdate {
        battery: Some(BatteryConfig {
            battery_type: BatteryType::LiFePo4,
            custom: None,
        }),
        protection: None,
    };
    assert!(matches!(
        rig.core.apply_config(lifepo4.clone()),
        Err(CoreError::InvalidState(_))
    ));

    rig.core.enter_config();
    rig.step();
    assert_eq!(rig.core.system_state(), SystemState::Config);
    let report = rig.step();
    assert_eq!(report.command.duty, 0.0, "no charging while configuring");

    let unsafe_custom = ConfigUpdate {
        battery: Some(BatteryConfig {
            battery_type: BatteryType::Custom,
            custom: Some(BatteryProfileConfig {
                bulk_voltage: 15.6,
                absorption_voltage: 15.4,
                float_voltage: 13.8,
                equalization_voltage: 15.6,
                min_voltage: 11.0,
                max_charge_current: 5.0,
                use_equalization: false,
                absorption_minutes: 60,
                name: "TOO-HOT".into(),
            }),
        }),
        protection: None,
    };
    assert!(matches!(
        rig.core.apply_config(unsafe_custom),
        Err(CoreError::Configuration(_))
    ));
    assert_eq!(rig.core.profile().name, "AGM");

    rig.core.apply_config(lifepo4).unwrap();
    assert_eq!(rig.core.profile().name, "LiFePO4");

    rig.core.exit_config();
    rig.step();
    assert_eq!(rig.core.system_state(), previous);
}

#[test]
fn history_keeps_last_thousand_and_days_roll_over() {
    let sink = CollectingSink::default();
    let mut config = AppConfig::default();
    config.controller.sleep_after = Duration::from_secs(3600);
    let mut rig = Rig::new(&config, Physical::sunrise());
    rig.core = ControlCore::new(&config, day(1))
        .unwrap()
        .with_stats_sink(Box::new(sink.clone()));
    rig.core.initialize(&mut ZeroInputs).unwrap();

    rig.run(600);
    rig.clock.set_date(day(2));
    rig.run(401);

    let history = rig.core.history();
    assert_eq!(history.len(), 1000);
    let first = history.iter().next().map(|r| r.timestamp_ms);
    assert_eq!(first, Some(2 * 200));
    assert_eq!(history.latest().map(|r| r.timestamp_ms), Some(1001 * 200));

    let finished = sink.0.lock().clone();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].date, day(1));
    assert_eq!(finished[0].samples, 600);
    assert_eq!(rig.core.daily_stats().date, day(2));
}

#[test]
fn publishes_serializable_snapshots() {
    let publisher = SnapshotPublisher::new();
    let mut rig = Rig::new(&AppConfig::default(), Physical::sunrise());
    rig.core = ControlCore::new(&AppConfig::default(), day(1))
        .unwrap()
        .with_publisher(publisher.clone());
    assert!(publisher.latest().is_none());
    rig.core.initialize(&mut ZeroInputs).unwrap();
    rig.run(3);

    let snapshot = publisher.latest().unwrap();
    assert_eq!(snapshot.state.cycle, 3);
    assert_eq!(snapshot.state.system_state, SystemState::Charging);
    assert_eq!(snapshot.battery, "AGM");
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["state"]["system_state"], "charging");
}
