//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Daily statistics and telemetry export for the daemon."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use r_mppt_core::{DailyStats, DailyStatsSink, TelemetryHistory, TracingStatsSink};
use tracing::{info, warn};

/// Appends every finished day to a CSV file and logs it.
pub struct CsvStatsSink {
    writer: csv::Writer<File>,
}

impl CsvStatsSink {
    pub fn open(path: &Path) -> Result<Self> {
        let exists = path.exists() && path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("unable to open daily stats file {}", path.display()))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(!exists)
            .from_writer(file);
        Ok(Self { writer })
    }
}

impl DailyStatsSink for CsvStatsSink {
    fn persist(&mut self, stats: &DailyStats) {
        TracingStatsSink.persist(stats);
        let written = self
            .writer
            .serialize(stats)
            .and_then(|()| self.writer.flush().map_err(csv::Error::from));
        if let Err(err) = written {
            warn!(error = %err, date = %stats.date, "failed to persist daily statistics");
        }
    }
}

/// Write the telemetry ring buffer to `path`, oldest record first.
pub fn export_history(history: &TelemetryHistory, path: &Path) -> Result<usize> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("unable to create history file {}", path.display()))?;
    let mut rows = 0;
    for record in history.iter() {
        writer.serialize(record)?;
        rows += 1;
    }
    writer.flush()?;
    info!(rows, path = %path.display(), "telemetry history exported");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use r_mppt_core::{ChargePhase, ConditionedReading, ErrorFlags, SystemState, TelemetryRecord};

    #[test]
    fn appends_days_with_single_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("daily.csv");
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        CsvStatsSink::open(&path)?.persist(&DailyStats::new(day));
        CsvStatsSink::open(&path)?.persist(&DailyStats::new(day.succ_opt().unwrap()));

        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("date,"));
        assert!(lines[2].starts_with("2024-06-02,"));
        Ok(())
    }

    #[test]
    fn exports_history_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("history.csv");
        let mut history = TelemetryHistory::new(2);
        for ts in [1_u64, 2, 3] {
            history.record(TelemetryRecord::new(
                ts,
                &ConditionedReading::default(),
                0.5,
                ChargePhase::Bulk,
                SystemState::Charging,
                ErrorFlags::empty(),
            ));
        }
        assert_eq!(export_history(&history, &path)?, 2);
        let contents = std::fs::read_to_string(&path)?;
        let stamps: Vec<_> = contents
            .lines()
            .skip(1)
            .filter_map(|line| line.split(',').next())
            .collect();
        assert_eq!(stamps, ["2", "3"]);
        Ok(())
    }
}
