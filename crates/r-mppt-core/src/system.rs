//! ---
//! mppt_section: "01-core-functionality"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Charge controller control core."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
//! Top-level operating mode of the controller.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::protection::ProtectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    #[default]
    Init,
    SelfTest,
    Idle,
    Charging,
    Fault,
    Sleep,
    Config,
}

impl SystemState {
    pub const ALL: [SystemState; 7] = [
        SystemState::Init,
        SystemState::SelfTest,
        SystemState::Idle,
        SystemState::Charging,
        SystemState::Fault,
        SystemState::Sleep,
        SystemState::Config,
    ];

    pub fn code(&self) -> u8 {
        match self {
            SystemState::Init => 0,
            SystemState::SelfTest => 1,
            SystemState::Idle => 2,
            SystemState::Charging => 3,
            SystemState::Fault => 4,
            SystemState::Sleep => 5,
            SystemState::Config => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Init => "init",
            SystemState::SelfTest => "self_test",
            SystemState::Idle => "idle",
            SystemState::Charging => "charging",
            SystemState::Fault => "fault",
            SystemState::Sleep => "sleep",
            SystemState::Config => "config",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External requests collected between cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemRequests {
    pub fault_clear: bool,
    pub sleep: bool,
    pub wake: bool,
    pub enter_config: bool,
    pub exit_config: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SystemInputs {
    pub calibrated: bool,
    /// Result of the plausibility check, present only on the self-test cycle.
    pub self_test: Option<bool>,
    pub panel_available: bool,
    pub protection: ProtectionState,
    /// Time since the panel was last available.
    pub inactive_for: Duration,
    pub requests: SystemRequests,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemTransition {
    pub from: SystemState,
    pub to: SystemState,
}

#[derive(Debug, Clone)]
pub struct SystemStateMachine {
    state: SystemState,
    resume_state: SystemState,
    self_test_failed: bool,
    sleep_after: Duration,
}

impl SystemStateMachine {
    pub fn new(sleep_after: Duration) -> Self {
        Self {
            state: SystemState::Init,
            resume_state: SystemState::Init,
            self_test_failed: false,
            sleep_after,
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn self_test_failed(&self) -> bool {
        self.self_test_failed
    }

    pub fn next_state(&self, inputs: &SystemInputs) -> SystemState {
        let requests = &inputs.requests;
        let tripped = inputs.protection >= ProtectionState::Fault;
        if requests.enter_config && self.state != SystemState::Config {
            return SystemState::Config;
        }
        match self.state {
            SystemState::Init if inputs.calibrated => SystemState::SelfTest,
            SystemState::Init => SystemState::Init,
            SystemState::SelfTest => match inputs.self_test {
                Some(true) => SystemState::Idle,
                Some(false) => SystemState::Fault,
                None => SystemState::SelfTest,
            },
            SystemState::Idle if tripped => SystemState::Fault,
            SystemState::Idle if requests.sleep || inputs.inactive_for >= self.sleep_after => {
                SystemState::Sleep
            }
            SystemState::Idle if inputs.panel_available => SystemState::Charging,
            SystemState::Idle => SystemState::Idle,
            SystemState::Charging if tripped => SystemState::Fault,
            SystemState::Charging if requests.sleep => SystemState::Sleep,
            SystemState::Charging if !inputs.panel_available => SystemState::Idle,
            SystemState::Charging => SystemState::Charging,
            SystemState::Fault if self.self_test_failed => {
                if requests.fault_clear && !tripped {
                    SystemState::Idle
                } else {
                    SystemState::Fault
                }
            }
            SystemState::Fault if tripped => SystemState::Fault,
            SystemState::Fault => SystemState::Idle,
            SystemState::Sleep if tripped => SystemState::Fault,
            SystemState::Sleep if requests.wake || inputs.panel_available => SystemState::Idle,
            SystemState::Sleep => SystemState::Sleep,
            SystemState::Config if requests.exit_config => self.resume_state,
            SystemState::Config => SystemState::Config,
        }
    }

    pub fn advance(&mut self, inputs: &SystemInputs) -> Option<SystemTransition> {
        let next = self.next_state(inputs);
        if next == self.state {
            return None;
        }
        let transition = SystemTransition {
            from: self.state,
            to: next,
        };
        match (self.state, next) {
            (SystemState::SelfTest, SystemState::Fault) => {
                warn!("self-test failed; holding fault until cleared");
                self.self_test_failed = true;
            }
            (SystemState::Fault, SystemState::Idle) => self.self_test_failed = false,
            (from, SystemState::Config) => self.resume_state = from,
            _ => {}
        }
        info!(from = %transition.from, to = %transition.to, protection = %inputs.protection, "system state change");
        self.state = next;
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> SystemInputs {
        SystemInputs {
            calibrated: true,
            self_test: None,
            panel_available: false,
            protection: ProtectionState::Normal,
            inactive_for: Duration::ZERO,
            requests: SystemRequests::default(),
        }
    }

    fn started() -> SystemStateMachine {
        let mut machine = SystemStateMachine::new(Duration::from_secs(600));
        machine.advance(&inputs());
        machine.advance(&SystemInputs {
            self_test: Some(true),
            ..inputs()
        });
        assert_eq!(machine.state(), SystemState::Idle);
        machine
    }

    #[test]
    fn waits_in_init_until_calibrated() {
        let mut machine = SystemStateMachine::new(Duration::from_secs(600));
        let uncalibrated = SystemInputs {
            calibrated: false,
            ..inputs()
        };
        assert_eq!(machine.advance(&uncalibrated), None);
        assert_eq!(machine.state(), SystemState::Init);
    }

    #[test]
    fn charges_when_panel_available_and_stops_on_fault() {
        let mut machine = started();
        let sunny = SystemInputs {
            panel_available: true,
            ..inputs()
        };
        machine.advance(&sunny);
        assert_eq!(machine.state(), SystemState::Charging);

        let tripped = SystemInputs {
            protection: ProtectionState::Emergency,
            ..sunny
        };
        machine.advance(&tripped);
        assert_eq!(machine.state(), SystemState::Fault);
        machine.advance(&tripped);
        assert_eq!(machine.state(), SystemState::Fault);
        machine.advance(&sunny);
        assert_eq!(machine.state(), SystemState::Idle);
    }

    #[test]
    fn failed_self_test_needs_fault_clear() {
        let mut machine = SystemStateMachine::new(Duration::from_secs(600));
        machine.advance(&inputs());
        machine.advance(&SystemInputs {
            self_test: Some(false),
            ..inputs()
        });
        assert_eq!(machine.state(), SystemState::Fault);
        machine.advance(&inputs());
        assert_eq!(machine.state(), SystemState::Fault);
        let clear = SystemInputs {
            requests: SystemRequests {
                fault_clear: true,
                ..SystemRequests::default()
            },
            ..inputs()
        };
        machine.advance(&clear);
        assert_eq!(machine.state(), SystemState::Idle);
    }

    #[test]
    fn sleeps_on_inactivity_and_wakes_with_panel() {
        let mut machine = started();
        machine.advance(&SystemInputs {
            inactive_for: Duration::from_secs(601),
            ..inputs()
        });
        assert_eq!(machine.state(), SystemState::Sleep);
        machine.advance(&inputs());
        assert_eq!(machine.state(), SystemState::Sleep);
        machine.advance(&SystemInputs {
            panel_available: true,
            ..inputs()
        });
        assert_eq!(machine.state(), SystemState::Idle);
    }

    #[test]
    fn config_returns_to_previous_state() {
        let mut machine = started();
        machine.advance(&SystemInputs {
            panel_available: true,
            ..inputs()
        });
        let request = |enter_config, exit_config| SystemInputs {
            panel_available: true,
            requests: SystemRequests {
                enter_config,
                exit_config,
                ..SystemRequests::default()
            },
            ..inputs()
        };
        machine.advance(&request(true, false));
        assert_eq!(machine.state(), SystemState::Config);
        machine.advance(&request(false, false));
        assert_eq!(machine.state(), SystemState::Config);
        machine.advance(&request(false, true));
        assert_eq!(machine.state(), SystemState::Charging);
    }
}
