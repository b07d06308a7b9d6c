//! Structured telemetry events kept in a bounded ring.
//!
//! Nothing in the control core reads these back; they exist for the command surface and
//! for offline inspection.

use crate::calibration::CalibrationDatum;
use cablebot_shared::{AxisId, Point3, TimeInterface};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryKind {
    ModeChanged {
        from: String,
        to: String,
    },
    CommandRejected {
        command: String,
        reason: String,
    },
    AxisHomed {
        axis: AxisId,
    },
    CalibrationGrid {
        points: Vec<[f64; 2]>,
    },
    CalibrationPoint {
        waypoint: usize,
        target: [f64; 2],
        lengths: [f64; 4],
    },
    MeasurementRejected {
        waypoint: usize,
        axis: AxisId,
        deviation: f64,
        failed_batches: u32,
    },
    CalibrationFinished {
        accepted: bool,
        fit_error: Option<f64>,
        anchors: Option<[Point3; 4]>,
        data: Vec<CalibrationDatum>,
    },
    CalibrationAborted {
        waypoint: usize,
        reason: String,
    },
    SafetyFlag {
        axis: Option<AxisId>,
        reason: String,
    },
    Panic {
        fault: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TelemetryKind,
}

pub struct TelemetryLog {
    clock: Arc<dyn TimeInterface>,
    events: VecDeque<TelemetryEvent>,
    capacity: usize,
    evicted: u64,
}

impl TelemetryLog {
    pub fn new(clock: Arc<dyn TimeInterface>, capacity: usize) -> Self {
        Self {
            clock,
            events: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    pub fn record(&mut self, kind: TelemetryKind) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.evicted += 1;
        }
        let timestamp = DateTime::<Utc>::from(self.clock.now_wallclock());
        self.events.push_back(TelemetryEvent { timestamp, kind });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events dropped because the ring was full.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &TelemetryEvent> {
        self.events.iter()
    }

    pub fn last(&self) -> Option<&TelemetryEvent> {
        self.events.back()
    }

    pub fn drain(&mut self) -> Vec<TelemetryEvent> {
        self.events.drain(..).collect()
    }
}

/// Appends events as JSON lines.
pub fn write_json_lines<W: Write>(writer: &mut W, events: &[TelemetryEvent]) -> std::io::Result<()> {
    for event in events {
        serde_json::to_writer(&mut *writer, event)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}
