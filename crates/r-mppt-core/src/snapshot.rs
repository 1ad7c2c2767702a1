//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::controller::ControllerState;
use crate::telemetry::DailyStats;

/// Consistent copy of the controller state taken at the end of a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub state: ControllerState,
    pub battery: String,
    pub daily: DailyStats,
    pub history_len: usize,
    pub captured_at_ms: u64,
}

/// Hands cycle-end snapshots to readers on other threads. Readers never see
/// a state the control cycle is still writing.
#[derive(Debug, Clone, Default)]
pub struct SnapshotPublisher {
    inner: Arc<RwLock<Option<ControllerSnapshot>>>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: ControllerSnapshot) {
        *self.inner.write() = Some(snapshot);
    }

    pub fn latest(&self) -> Option<ControllerSnapshot> {
        self.inner.read().clone()
    }
}
