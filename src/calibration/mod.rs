//! Self-calibration: visit a grid of points, measure the belts at each one, fit the
//! anchors.

pub mod grid;
pub mod measurement;
pub mod solver;

use crate::motion::axis::AxisUnit;
use crate::motion::kinematics::FrameGeometry;
use crate::telemetry::{TelemetryKind, TelemetryLog};
use cablebot_shared::config::{CalibrationConfig, Orientation};
use cablebot_shared::{AxisId, Point3};
use grid::{generate_grid, travel_direction, Direction};
use measurement::{BatchStatus, MeasurementBatch};
use serde::Serialize;
use solver::{solve_anchors, FitResult};
use std::time::{Duration, Instant};

/// Averaged belt lengths (anchor to sled, offsets included) at one waypoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationDatum {
    pub waypoint: usize,
    pub target: [f64; 2],
    pub lengths: [f64; 4],
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub data: Vec<CalibrationDatum>,
    pub fit: Option<FitResult>,
    pub accepted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationStep {
    Working,
    /// Pause the supervisor for this long before the next step.
    Hold(Duration),
    Finished(CalibrationReport),
    Aborted(String),
}

#[derive(Debug, Clone)]
struct Travel {
    from: [f64; 2],
    to: [f64; 2],
    direction: Direction,
    started: Option<Instant>,
    commanded: [f64; 2],
    last_step: Option<Instant>,
}

#[derive(Debug, Clone)]
struct Measure {
    hold: [AxisId; 2],
    pull: [AxisId; 2],
    first_tight: bool,
}

#[derive(Debug, Clone)]
enum Phase {
    Travel(Travel),
    Measure(Measure),
    Done,
}

#[derive(Debug)]
pub struct CalibrationEngine {
    config: CalibrationConfig,
    orientation: Orientation,
    initial_anchors: [Point3; 4],
    grid: Vec<[f64; 2]>,
    waypoint: usize,
    position: [f64; 2],
    phase: Phase,
    batch: MeasurementBatch,
    failed_batches: u32,
    data: Vec<CalibrationDatum>,
}

impl CalibrationEngine {
    /// Starts from the frame center, which is where extend leaves the sled.
    pub fn new(config: &CalibrationConfig, orientation: Orientation, geometry: &FrameGeometry) -> Self {
        let grid = generate_grid(
            geometry.width(),
            geometry.height(),
            config.grid_offset,
            config.grid_columns,
            config.grid_rows,
        );
        let start = [0.0, 0.0];
        let first = grid.first().copied().unwrap_or(start);
        Self {
            config: config.clone(),
            orientation,
            initial_anchors: geometry.anchors(),
            phase: Phase::Travel(Travel::new(start, first, orientation)),
            grid,
            waypoint: 0,
            position: start,
            batch: MeasurementBatch::new(config.discard_samples, config.kept_samples, config.max_deviation),
            failed_batches: 0,
            data: Vec::new(),
        }
    }

    pub fn grid(&self) -> &[[f64; 2]] {
        &self.grid
    }

    pub fn waypoint(&self) -> usize {
        self.waypoint
    }

    pub fn failed_batches(&self) -> u32 {
        self.failed_batches
    }

    pub fn data(&self) -> &[CalibrationDatum] {
        &self.data
    }

    /// Last point the sled was brought to, center-relative.
    pub fn position(&self) -> [f64; 2] {
        self.position
    }

    pub fn phase_name(&self) -> &'static str {
        match self.phase {
            Phase::Travel(_) => "travel",
            Phase::Measure(_) => "measure",
            Phase::Done => "done",
        }
    }

    /// Advances the calibration by one tick.
    pub fn step(
        &mut self,
        axes: &mut [AxisUnit; 4],
        geometry: &FrameGeometry,
        telemetry: &mut TelemetryLog,
        now: Instant,
    ) -> CalibrationStep {
        match &mut self.phase {
            Phase::Travel(travel) => {
                if !move_with_slack(travel, axes, geometry, &self.config, self.orientation, now) {
                    return CalibrationStep::Working;
                }
                let to = travel.to;
                let direction = travel.direction;
                for axis in axes.iter_mut() {
                    axis.stop();
                    axis.reset(now);
                }
                self.position = to;
                tracing::info!(
                    "Calibration waypoint {}/{} reached at ({:.1}, {:.1})",
                    self.waypoint + 1,
                    self.grid.len(),
                    to[0],
                    to[1]
                );
                self.phase = Phase::Measure(Measure {
                    hold: direction.leading_axes(),
                    pull: direction.pull_order(to),
                    first_tight: false,
                });
                CalibrationStep::Hold(self.config.hold())
            }
            Phase::Measure(measure) => {
                for axis in measure.hold {
                    axes[axis.index()].recompute_pid(None);
                }
                let [first, second] = measure.pull;
                if !measure.first_tight {
                    if axes[first.index()].pull_tight(now) {
                        measure.first_tight = true;
                    }
                    if self.batch.seen() == 0 {
                        axes[second.index()].comply(now);
                    } else {
                        axes[second.index()].stop();
                    }
                    return CalibrationStep::Working;
                }
                if !axes[second.index()].pull_tight(now) {
                    return CalibrationStep::Working;
                }
                let offset = geometry.belt_offset();
                let sample = AxisId::ALL.map(|axis| axes[axis.index()].position() + offset);
                axes[first.index()].reset(now);
                axes[second.index()].reset(now);
                measure.first_tight = false;
                tracing::debug!("Measurement {} at waypoint {}: {:?}", self.batch.seen(), self.waypoint, sample);
                self.record_sample(sample, telemetry)
            }
            Phase::Done => CalibrationStep::Working,
        }
    }

    /// Feeds one four-belt measurement taken at the current waypoint.
    pub fn record_sample(&mut self, sample: [f64; 4], telemetry: &mut TelemetryLog) -> CalibrationStep {
        match self.batch.push(sample) {
            BatchStatus::Collecting => CalibrationStep::Working,
            BatchStatus::Rejected(rejection) => {
                self.failed_batches += 1;
                self.batch.restart();
                tracing::warn!(
                    "Measurement batch at waypoint {} rejected: {} spread {:.2} mm ({} of {})",
                    self.waypoint,
                    rejection.axis,
                    rejection.deviation,
                    self.failed_batches,
                    self.config.max_failed_batches
                );
                telemetry.record(TelemetryKind::MeasurementRejected {
                    waypoint: self.waypoint,
                    axis: rejection.axis,
                    deviation: rejection.deviation,
                    failed_batches: self.failed_batches,
                });
                if self.failed_batches >= self.config.max_failed_batches {
                    let reason = format!(
                        "{} consecutive inconsistent measurement batches at waypoint {}",
                        self.failed_batches, self.waypoint
                    );
                    tracing::error!("Calibration aborted: {}", reason);
                    telemetry.record(TelemetryKind::CalibrationAborted {
                        waypoint: self.waypoint,
                        reason: reason.clone(),
                    });
                    self.phase = Phase::Done;
                    return CalibrationStep::Aborted(reason);
                }
                CalibrationStep::Working
            }
            BatchStatus::Accepted(lengths) => {
                self.failed_batches = 0;
                self.batch.restart();
                let target = self.grid.get(self.waypoint).copied().unwrap_or(self.position);
                tracing::info!(
                    "Calibration point {}: TL {:.2} TR {:.2} BL {:.2} BR {:.2}",
                    self.waypoint,
                    lengths[0],
                    lengths[1],
                    lengths[2],
                    lengths[3]
                );
                telemetry.record(TelemetryKind::CalibrationPoint {
                    waypoint: self.waypoint,
                    target,
                    lengths,
                });
                self.data.push(CalibrationDatum {
                    waypoint: self.waypoint,
                    target,
                    lengths,
                });
                self.waypoint += 1;
                match self.grid.get(self.waypoint) {
                    Some(&next) => {
                        self.phase = Phase::Travel(Travel::new(target, next, self.orientation));
                        CalibrationStep::Hold(self.config.hold())
                    }
                    None => self.finish(telemetry),
                }
            }
        }
    }

    fn finish(&mut self, telemetry: &mut TelemetryLog) -> CalibrationStep {
        self.phase = Phase::Done;
        for datum in &self.data {
            tracing::info!("Calibration data {}: {:?} -> {:?}", datum.waypoint, datum.target, datum.lengths);
        }
        let report = match solve_anchors(&self.data, self.initial_anchors) {
            Ok(fit) => {
                let accepted = fit.fit_error < self.config.fit_threshold;
                let reason = (!accepted).then(|| {
                    format!("fit error {:.3} mm is above {:.3} mm", fit.fit_error, self.config.fit_threshold)
                });
                CalibrationReport {
                    data: self.data.clone(),
                    fit: Some(fit),
                    accepted,
                    reason,
                }
            }
            Err(e) => CalibrationReport {
                data: self.data.clone(),
                fit: None,
                accepted: false,
                reason: Some(e.to_string()),
            },
        };
        telemetry.record(TelemetryKind::CalibrationFinished {
            accepted: report.accepted,
            fit_error: report.fit.as_ref().map(|f| f.fit_error),
            anchors: report.fit.as_ref().filter(|_| report.accepted).map(|f| f.anchors),
            data: report.data.clone(),
        });
        CalibrationStep::Finished(report)
    }
}

impl Travel {
    fn new(from: [f64; 2], to: [f64; 2], orientation: Orientation) -> Self {
        Self {
            from,
            to,
            direction: travel_direction(from, to, orientation),
            started: None,
            commanded: from,
            last_step: None,
        }
    }
}

/// Moves the sled between two points with the trailing belts slack: decompress, let the
/// belts settle, then walk the leading belts to the target while the others comply.
/// Returns true on arrival.
fn move_with_slack(
    travel: &mut Travel,
    axes: &mut [AxisUnit; 4],
    geometry: &FrameGeometry,
    config: &CalibrationConfig,
    orientation: Orientation,
    now: Instant,
) -> bool {
    let leading = travel.direction.leading_axes();
    let trailing = travel.direction.trailing_axes();
    let started = match travel.started {
        Some(started) => started,
        None => {
            for axis in leading {
                let length = geometry.belt_length(axis, &[travel.from[0], travel.from[1], 0.0]);
                axes[axis.index()].set_target(length);
            }
            travel.started = Some(now);
            now
        }
    };
    let elapsed = now.saturating_duration_since(started);

    if elapsed < config.decompress() {
        if orientation == Orientation::Vertical {
            for axis in leading {
                axes[axis.index()].recompute_pid(None);
            }
            for axis in trailing {
                axes[axis.index()].decompress_belt();
            }
        } else {
            for axis in axes.iter_mut() {
                axis.decompress_belt();
            }
        }
        return false;
    }
    if elapsed < config.decompress() + config.settle() {
        for axis in axes.iter_mut() {
            axis.stop();
        }
        return false;
    }

    let dt = match travel.last_step {
        Some(last) => now.saturating_duration_since(last).min(Duration::from_millis(50)),
        None => {
            for axis in axes.iter_mut() {
                axis.reset(now);
            }
            Duration::ZERO
        }
    };
    travel.last_step = Some(now);
    travel.commanded = step_toward(travel.commanded, travel.to, config.travel_speed * dt.as_secs_f64());

    let target = [travel.commanded[0], travel.commanded[1], 0.0];
    for axis in leading {
        let unit = &mut axes[axis.index()];
        unit.set_target(geometry.belt_length(axis, &target));
        unit.recompute_pid(None);
    }
    for axis in trailing {
        axes[axis.index()].comply(now);
    }

    travel.commanded == travel.to
        && leading
            .iter()
            .all(|axis| axes[axis.index()].on_target(config.arrival_tolerance))
}

fn step_toward(from: [f64; 2], to: [f64; 2], max_step: f64) -> [f64; 2] {
    let dx = to[0] - from[0];
    let dy = to[1] - from[1];
    let distance = dx.hypot(dy);
    if distance <= max_step {
        return to;
    }
    let scale = max_step / distance;
    [from[0] + dx * scale, from[1] + dy * scale]
}
