// src/motion/mode.rs - bulk motion modes of the supervisor

use crate::calibration::CalibrationEngine;
use cablebot_shared::AxisId;
use std::time::{Duration, Instant};

/// Length of the staggered decompression before extend and comply.
pub const DECOMPRESS_WINDOW: Duration = Duration::from_millis(700);

/// When each axis starts decompressing inside the window, indexed by `AxisId::index`.
const DECOMPRESS_OFFSETS_MS: [u64; 4] = [350, 250, 150, 0];

pub fn decompress_offset(axis: AxisId) -> Duration {
    Duration::from_millis(DECOMPRESS_OFFSETS_MS[axis.index()])
}

/// At most one of these runs at a time; starting one replaces the other.
#[derive(Debug, Default)]
pub enum SupervisorMode {
    #[default]
    Idle,
    Retracting {
        pending: [bool; 4],
    },
    Extending {
        started: Instant,
        targets: [f64; 4],
        done: [bool; 4],
    },
    Complying {
        started: Instant,
    },
    Tightening {
        done: [bool; 4],
    },
    Calibrating(Box<CalibrationEngine>),
}

impl SupervisorMode {
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorMode::Idle => "idle",
            SupervisorMode::Retracting { .. } => "retracting",
            SupervisorMode::Extending { .. } => "extending",
            SupervisorMode::Complying { .. } => "complying",
            SupervisorMode::Tightening { .. } => "tightening",
            SupervisorMode::Calibrating(_) => "calibrating",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SupervisorMode::Idle)
    }

    pub fn calibration(&self) -> Option<&CalibrationEngine> {
        match self {
            SupervisorMode::Calibrating(engine) => Some(engine),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bottom_right_decompresses_first() {
        let order: Vec<u64> = AxisId::ALL.iter().map(|a| decompress_offset(*a).as_millis() as u64).collect();
        assert_eq!(order, vec![350, 250, 150, 0]);
        assert!(AxisId::ALL.iter().all(|a| decompress_offset(*a) < DECOMPRESS_WINDOW));
    }

    #[test]
    fn names_are_stable() {
        assert_eq!(SupervisorMode::default().name(), "idle");
        assert!(SupervisorMode::default().is_idle());
        let retracting = SupervisorMode::Retracting { pending: [true; 4] };
        assert_eq!(retracting.name(), "retracting");
        assert!(retracting.calibration().is_none());
    }
}
