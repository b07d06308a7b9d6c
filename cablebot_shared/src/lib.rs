// cablebot_shared: shared traits and types for the host, the simulator and the control core

pub mod config;
pub mod hardware_traits;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Instant, SystemTime};

// --- Shared Traits and Types ---

// TimeInterface trait
pub trait TimeInterface: Send + Sync {
    fn now_monotonic(&self) -> Instant;
    fn now_wallclock(&self) -> SystemTime;
}

/// Wall-clock backed time source used on real hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdTimeSync;

impl TimeInterface for StdTimeSync {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn now_wallclock(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// One winch per frame corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisId {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl AxisId {
    pub const ALL: [AxisId; 4] = [
        AxisId::TopLeft,
        AxisId::TopRight,
        AxisId::BottomLeft,
        AxisId::BottomRight,
    ];

    pub fn index(self) -> usize {
        match self {
            AxisId::TopLeft => 0,
            AxisId::TopRight => 1,
            AxisId::BottomLeft => 2,
            AxisId::BottomRight => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AxisId::TopLeft => "TL",
            AxisId::TopRight => "TR",
            AxisId::BottomLeft => "BL",
            AxisId::BottomRight => "BR",
        }
    }

    pub fn is_top(self) -> bool {
        matches!(self, AxisId::TopLeft | AxisId::TopRight)
    }

    pub fn from_name(name: &str) -> Option<AxisId> {
        match name.to_ascii_lowercase().as_str() {
            "tl" | "top_left" => Some(AxisId::TopLeft),
            "tr" | "top_right" => Some(AxisId::TopRight),
            "bl" | "bottom_left" => Some(AxisId::BottomLeft),
            "br" | "bottom_right" => Some(AxisId::BottomRight),
            _ => None,
        }
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// External machine status register shared with the motion planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    #[default]
    Idle,
    Alarm,
    Homing,
    Jog,
    Cycle,
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineStatus::Idle => "Idle",
            MachineStatus::Alarm => "Alarm",
            MachineStatus::Homing => "Homing",
            MachineStatus::Jog => "Jog",
            MachineStatus::Cycle => "Cycle",
        };
        f.write_str(name)
    }
}

/// What the planner exposes to the winch core: its status and its current target.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlannerState {
    pub status: MachineStatus,
    pub target: [f64; 3],
}

impl PlannerState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A point in frame coordinates (mm).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Point3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &Point3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}
