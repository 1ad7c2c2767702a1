//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Telemetry history and daily statistics.
//!
//! Records are stored in a fixed-capacity ring buffer that overwrites the
//! oldest entry once full. Each record also has a packed little-endian frame
//! used for exports:
//!
//! | offset | size | field                        |
//! |--------|------|------------------------------|
//! | 0      | 8    | timestamp, ms (u64)          |
//! | 8      | 36   | nine f32 measurements        |
//! | 44     | 1    | charge phase code            |
//! | 45     | 1    | system state code            |
//! | 46     | 1    | error flag bits              |

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::NaiveDate;
use r_mppt_common::time::duration_to_hours;
use serde::{Deserialize, Serialize};

use crate::charge::ChargePhase;
use crate::error::DecodeError;
use crate::protection::ErrorFlags;
use crate::reading::ConditionedReading;
use crate::system::SystemState;

pub const RECORD_LEN: usize = 47;

/// Efficiency only enters the daily mean while the panel delivers at least this much.
const EFFICIENCY_POWER_FLOOR: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp_ms: u64,
    pub panel_voltage: f32,
    pub panel_current: f32,
    pub panel_power: f32,
    pub battery_voltage: f32,
    pub battery_current: f32,
    pub battery_power: f32,
    pub efficiency: f32,
    pub temperature: f32,
    /// Percent.
    pub pwm_duty: f32,
    pub charge_phase: ChargePhase,
    pub system_state: SystemState,
    pub error_flags: ErrorFlags,
}

impl TelemetryRecord {
    pub fn new(
        timestamp_ms: u64,
        reading: &ConditionedReading,
        duty: f32,
        charge_phase: ChargePhase,
        system_state: SystemState,
        error_flags: ErrorFlags,
    ) -> Self {
        Self {
            timestamp_ms,
            panel_voltage: reading.panel_voltage,
            panel_current: reading.panel_current,
            panel_power: reading.panel_power,
            battery_voltage: reading.battery_voltage,
            battery_current: reading.battery_current,
            battery_power: reading.battery_power,
            efficiency: reading.efficiency,
            temperature: reading.temperature,
            pwm_duty: duty * 100.0,
            charge_phase,
            system_state,
            error_flags,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.timestamp_ms);
        for value in [
            self.panel_voltage,
            self.panel_current,
            self.panel_power,
            self.battery_voltage,
            self.battery_current,
            self.battery_power,
            self.efficiency,
            self.temperature,
            self.pwm_duty,
        ] {
            buf.put_f32_le(value);
        }
        buf.put_u8(self.charge_phase.code());
        buf.put_u8(self.system_state.code());
        buf.put_u8(self.error_flags.bits());
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RECORD_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        if buf.remaining() < RECORD_LEN {
            return Err(DecodeError::Truncated {
                needed: RECORD_LEN,
                available: buf.remaining(),
            });
        }
        let timestamp_ms = buf.get_u64_le();
        let mut values = [0.0f32; 9];
        for value in &mut values {
            *value = buf.get_f32_le();
        }
        let phase = buf.get_u8();
        let state = buf.get_u8();
        let flags = buf.get_u8();
        let [panel_voltage, panel_current, panel_power, battery_voltage, battery_current, battery_power, efficiency, temperature, pwm_duty] =
            values;
        Ok(Self {
            timestamp_ms,
            panel_voltage,
            panel_current,
            panel_power,
            battery_voltage,
            battery_current,
            battery_power,
            efficiency,
            temperature,
            pwm_duty,
            charge_phase: ChargePhase::from_code(phase).ok_or(DecodeError::UnknownPhase(phase))?,
            system_state: SystemState::from_code(state).ok_or(DecodeError::UnknownState(state))?,
            error_flags: ErrorFlags::from_bits(flags),
        })
    }
}

/// Fixed-capacity ring of the most recent records.
#[derive(Debug, Clone)]
pub struct TelemetryHistory {
    slots: Vec<TelemetryRecord>,
    capacity: usize,
    index: usize,
}

impl TelemetryHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            index: 0,
        }
    }

    pub fn record(&mut self, record: TelemetryRecord) {
        if self.slots.len() < self.capacity {
            self.slots.push(record);
        } else {
            self.slots[self.index] = record;
        }
        self.index = (self.index + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TelemetryRecord> {
        let start = if self.slots.len() < self.capacity {
            0
        } else {
            self.index
        };
        let (newer, older) = self.slots.split_at(start);
        older.iter().chain(newer.iter())
    }

    pub fn latest(&self) -> Option<&TelemetryRecord> {
        if self.slots.is_empty() {
            return None;
        }
        let last = (self.index + self.capacity - 1) % self.capacity;
        self.slots.get(last)
    }

    /// Point-in-time copy, oldest first.
    pub fn snapshot(&self) -> Vec<TelemetryRecord> {
        self.iter().copied().collect()
    }

    pub fn encode_all(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len() * RECORD_LEN);
        for record in self.iter() {
            record.encode(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode_all(mut bytes: Bytes) -> Result<Vec<TelemetryRecord>, DecodeError> {
        let mut records = Vec::with_capacity(bytes.len() / RECORD_LEN);
        while bytes.has_remaining() {
            records.push(TelemetryRecord::decode(&mut bytes)?);
        }
        Ok(records)
    }
}

/// Aggregates for one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub max_power: f32,
    pub total_energy_wh: f64,
    pub avg_efficiency: f32,
    pub charge_cycles: u32,
    pub min_battery_voltage: f32,
    pub max_battery_voltage: f32,
    pub samples: u64,
    efficiency_samples: u64,
}

impl DailyStats {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            max_power: 0.0,
            total_energy_wh: 0.0,
            avg_efficiency: 0.0,
            charge_cycles: 0,
            min_battery_voltage: 0.0,
            max_battery_voltage: 0.0,
            samples: 0,
            efficiency_samples: 0,
        }
    }

    /// Fold one record in. `elapsed` is the time since the previous record.
    pub fn update(&mut self, record: &TelemetryRecord, elapsed: Duration) {
        self.max_power = self.max_power.max(record.panel_power);
        if record.battery_power > 0.0 {
            self.total_energy_wh += f64::from(record.battery_power) * duration_to_hours(elapsed);
        }
        if record.panel_power >= EFFICIENCY_POWER_FLOOR {
            self.efficiency_samples += 1;
            let n = self.efficiency_samples as f32;
            self.avg_efficiency += (record.efficiency - self.avg_efficiency) / n;
        }
        let v = record.battery_voltage;
        if self.samples == 0 {
            self.min_battery_voltage = v;
            self.max_battery_voltage = v;
        } else {
            self.min_battery_voltage = self.min_battery_voltage.min(v);
            self.max_battery_voltage = self.max_battery_voltage.max(v);
        }
        self.samples += 1;
    }
}

/// History plus the running day, with rollover detection.
#[derive(Debug, Clone)]
pub struct TelemetryRecorder {
    history: TelemetryHistory,
    today: DailyStats,
}

impl TelemetryRecorder {
    pub fn new(capacity: usize, date: NaiveDate) -> Self {
        Self {
            history: TelemetryHistory::new(capacity),
            today: DailyStats::new(date),
        }
    }

    /// Store the record and update the day. Returns the finished day when
    /// `date` has moved past the running one.
    pub fn record(
        &mut self,
        record: TelemetryRecord,
        date: NaiveDate,
        elapsed: Duration,
    ) -> Option<DailyStats> {
        self.history.record(record);
        let finished = if date != self.today.date {
            Some(std::mem::replace(&mut self.today, DailyStats::new(date)))
        } else {
            None
        };
        self.today.update(&record, elapsed);
        finished
    }

    pub fn note_charge_cycle(&mut self) {
        self.today.charge_cycles += 1;
    }

    pub fn history(&self) -> &TelemetryHistory {
        &self.history
    }

    pub fn today(&self) -> &DailyStats {
        &self.today
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(timestamp_ms: u64) -> TelemetryRecord {
        let reading = ConditionedReading {
            panel_voltage: 18.0,
            panel_current: 2.0,
            panel_power: 36.0,
            battery_voltage: 13.2,
            battery_current: 2.5,
            battery_power: 33.0,
            temperature: 31.5,
            efficiency: 91.6,
        };
        TelemetryRecord::new(
            timestamp_ms,
            &reading,
            0.55,
            ChargePhase::Bulk,
            SystemState::Charging,
            ErrorFlags::OVER_CURRENT,
        )
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    #[test]
    fn frame_layout_is_packed() {
        let bytes = record(0x0102).to_bytes();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(&bytes[..2], &[0x02, 0x01]);
        assert_eq!(bytes[44], ChargePhase::Bulk.code());
        assert_eq!(bytes[45], SystemState::Charging.code());
        assert_eq!(bytes[46], ErrorFlags::OVER_CURRENT.bits());
        let decoded = TelemetryRecord::decode(&mut bytes.clone()).unwrap();
        assert_eq!(decoded, record(0x0102));
    }

    #[test]
    fn decode_rejects_bad_frames() {
        let bytes = record(1).to_bytes();
        let mut short = bytes.slice(..20);
        assert!(matches!(
            TelemetryRecord::decode(&mut short),
            Err(DecodeError::Truncated { available: 20, .. })
        ));
        let mut corrupt = BytesMut::from(&bytes[..]);
        corrupt[44] = 9;
        assert_eq!(
            TelemetryRecord::decode(&mut corrupt.freeze()),
            Err(DecodeError::UnknownPhase(9))
        );
    }

    #[test]
    fn ring_keeps_most_recent_in_order() {
        let mut history = TelemetryHistory::new(1000);
        for n in 1..=1001 {
            history.record(record(n));
        }
        assert_eq!(history.len(), 1000);
        let stamps: Vec<u64> = history.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(stamps.first(), Some(&2));
        assert_eq!(stamps.last(), Some(&1001));
        assert!(stamps.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(history.latest().map(|r| r.timestamp_ms), Some(1001));
    }

    #[test]
    fn partial_ring_and_export() {
        let mut history = TelemetryHistory::new(4);
        assert!(history.latest().is_none());
        for n in 0..3 {
            history.record(record(n));
        }
        let decoded = TelemetryHistory::decode_all(history.encode_all()).unwrap();
        assert_eq!(decoded, history.snapshot());
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn daily_stats_integrate_and_roll_over() {
        let mut recorder = TelemetryRecorder::new(16, date(1));
        let tick = Duration::from_secs(360);
        for n in 0..10 {
            assert!(recorder.record(record(n), date(1), tick).is_none());
        }
        recorder.note_charge_cycle();
        let today = recorder.today().clone();
        assert!((today.total_energy_wh - 33.0).abs() < 1e-6);
        assert_eq!(today.max_power, 36.0);
        assert!((today.avg_efficiency - 91.6).abs() < 1e-3);
        assert_eq!(today.min_battery_voltage, 13.2);

        let finished = recorder.record(record(10), date(2), tick).unwrap();
        assert_eq!(finished.date, date(1));
        assert_eq!(finished.charge_cycles, 1);
        assert_eq!(recorder.today().date, date(2));
        assert_eq!(recorder.today().samples, 1);
    }
}
