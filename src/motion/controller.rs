// src/motion/controller.rs - top-level supervisor, driven by one tick call

use crate::calibration::{CalibrationEngine, CalibrationReport, CalibrationStep};
use crate::motion::axis::AxisUnit;
use crate::motion::kinematics::{FrameGeometry, Kinematics};
use crate::motion::mode::{decompress_offset, SupervisorMode, DECOMPRESS_WINDOW};
use crate::safety::{FaultKind, SafetyMonitor};
use crate::telemetry::{TelemetryKind, TelemetryLog, DEFAULT_CAPACITY};
use cablebot_shared::config::{
    frame_dimension_in_range, CalibrationConfig, Config, Orientation, MAX_FRAME_DIMENSION, MIN_FRAME_DIMENSION,
};
use cablebot_shared::hardware_traits::BoardIo;
use cablebot_shared::{AxisId, MachineStatus, PlannerState, Point3, TimeInterface};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a command was refused. Refusals never change anything beyond the status register.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("all axes must be homed first (not homed: {0})")]
    NotHomed(String),
    #[error("frame {dimension} {value} mm is outside [{min}, {max}]", min = MIN_FRAME_DIMENSION, max = MAX_FRAME_DIMENSION)]
    FrameOutOfRange { dimension: &'static str, value: f64 },
    #[error("machine is in alarm, send stop to clear it")]
    InAlarm,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not allowed while {0}")]
    Busy(&'static str),
}

/// User-facing commands.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SupervisorCommand {
    RetractAll,
    RetractAxis { axis: String },
    ExtendAll,
    ComplyAll,
    PullTight,
    Calibrate,
    Stop,
    Estop,
    SetFrameWidth { value: f64 },
    SetFrameHeight { value: f64 },
    SetSafety { enabled: bool },
}

impl SupervisorCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorCommand::RetractAll => "retract_all",
            SupervisorCommand::RetractAxis { .. } => "retract_axis",
            SupervisorCommand::ExtendAll => "extend_all",
            SupervisorCommand::ComplyAll => "comply_all",
            SupervisorCommand::PullTight => "pull_tight",
            SupervisorCommand::Calibrate => "calibrate",
            SupervisorCommand::Stop => "stop",
            SupervisorCommand::Estop => "estop",
            SupervisorCommand::SetFrameWidth { .. } => "set_frame_width",
            SupervisorCommand::SetFrameHeight { .. } => "set_frame_height",
            SupervisorCommand::SetSafety { .. } => "set_safety",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AxisSnapshot {
    pub axis: AxisId,
    pub homed: bool,
    pub position: f64,
    pub target: f64,
    pub error: f64,
    pub current: f64,
    pub speed: f64,
    pub power: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationProgress {
    pub waypoint: usize,
    pub total: usize,
    pub phase: &'static str,
    pub failed_batches: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorSnapshot {
    pub status: MachineStatus,
    pub mode: &'static str,
    pub planner_target: [f64; 3],
    pub axes: Vec<AxisSnapshot>,
    pub anchors: [Point3; 4],
    pub center: [f64; 2],
    pub frame_width: f64,
    pub frame_height: f64,
    /// Sled position recovered from the top belts, center-relative. None until homed.
    pub sled_estimate: Option<[f64; 3]>,
    pub safety_enabled: bool,
    pub panic_count: u64,
    pub last_fault: Option<String>,
    pub calibration: Option<CalibrationProgress>,
}

/// Owns the four axes and the frame geometry; every mutation happens inside `tick` or
/// one of the command methods, all called from a single task.
pub struct MotionSupervisor {
    clock: Arc<dyn TimeInterface>,
    axes: [AxisUnit; 4],
    geometry: FrameGeometry,
    frame_width: f64,
    frame_height: f64,
    orientation: Orientation,
    calibration_config: CalibrationConfig,
    extend_lower_offset: f64,
    planner: PlannerState,
    mode: SupervisorMode,
    safety: SafetyMonitor,
    safety_enabled: bool,
    telemetry: TelemetryLog,
    board: Option<Box<dyn BoardIo>>,
    hold_until: Option<Instant>,
    last_tick: Option<Instant>,
    last_servo_warning: Option<Instant>,
    panic_count: u64,
    last_fault: Option<FaultKind>,
}

impl MotionSupervisor {
    pub fn new(config: &Config, clock: Arc<dyn TimeInterface>, axes: [AxisUnit; 4]) -> Self {
        let geometry = FrameGeometry::from_config(&config.frame);
        tracing::info!(
            "Supervisor ready: frame {}x{} mm ({:?}), center ({:.1}, {:.1})",
            config.frame.width,
            config.frame.height,
            config.frame.orientation,
            geometry.center()[0],
            geometry.center()[1]
        );
        Self {
            telemetry: TelemetryLog::new(clock.clone(), DEFAULT_CAPACITY),
            clock,
            axes,
            geometry,
            frame_width: config.frame.width,
            frame_height: config.frame.height,
            orientation: config.frame.orientation,
            calibration_config: config.calibration.clone(),
            extend_lower_offset: config.calibration.extend_lower_offset,
            planner: PlannerState::new(),
            mode: SupervisorMode::Idle,
            safety: SafetyMonitor::new(&config.safety),
            safety_enabled: config.safety.enabled,
            board: None,
            hold_until: None,
            last_tick: None,
            last_servo_warning: None,
            panic_count: 0,
            last_fault: None,
        }
    }

    pub fn with_board(mut self, board: Box<dyn BoardIo>) -> Self {
        self.board = Some(board);
        self
    }

    pub fn status(&self) -> MachineStatus {
        self.planner.status
    }

    /// External status register write, as done by the motion planner.
    pub fn set_status(&mut self, status: MachineStatus) {
        self.planner.status = status;
    }

    pub fn planner(&self) -> &PlannerState {
        &self.planner
    }

    pub fn mode(&self) -> &SupervisorMode {
        &self.mode
    }

    pub fn axis(&self, axis: AxisId) -> &AxisUnit {
        &self.axes[axis.index()]
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    pub fn telemetry(&self) -> &TelemetryLog {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut TelemetryLog {
        &mut self.telemetry
    }

    pub fn safety_enabled(&self) -> bool {
        self.safety_enabled
    }

    pub fn panic_count(&self) -> u64 {
        self.panic_count
    }

    pub fn last_fault(&self) -> Option<&FaultKind> {
        self.last_fault.as_ref()
    }

    pub fn is_holding(&self) -> bool {
        self.hold_until.is_some()
    }

    pub fn all_homed(&self) -> bool {
        self.axes.iter().all(|axis| axis.is_homed())
    }

    pub fn execute(&mut self, command: SupervisorCommand) -> Result<(), CommandError> {
        match command {
            SupervisorCommand::RetractAll => self.retract_all(),
            SupervisorCommand::RetractAxis { axis } => match AxisId::from_name(&axis) {
                Some(axis) => self.retract_axis(axis),
                None => self.reject("retract_axis", CommandError::InvalidArgument(format!("unknown axis '{}'", axis))),
            },
            SupervisorCommand::ExtendAll => self.extend_all(),
            SupervisorCommand::ComplyAll => self.comply_all(),
            SupervisorCommand::PullTight => self.pull_tight_all(),
            SupervisorCommand::Calibrate => self.calibrate(),
            SupervisorCommand::Stop => {
                self.stop();
                Ok(())
            }
            SupervisorCommand::Estop => {
                self.panic(FaultKind::Requested {
                    reason: "emergency stop command".to_string(),
                });
                Ok(())
            }
            SupervisorCommand::SetFrameWidth { value } => self.set_frame_width(value),
            SupervisorCommand::SetFrameHeight { value } => self.set_frame_height(value),
            SupervisorCommand::SetSafety { enabled } => {
                self.set_safety_enabled(enabled);
                Ok(())
            }
        }
    }

    pub fn retract_all(&mut self) -> Result<(), CommandError> {
        self.ensure_not_alarm("retract_all")?;
        self.start_mode(SupervisorMode::Retracting { pending: [true; 4] });
        Ok(())
    }

    /// Adds one axis to the running retract, or starts a new one.
    pub fn retract_axis(&mut self, axis: AxisId) -> Result<(), CommandError> {
        self.ensure_not_alarm("retract_axis")?;
        if let SupervisorMode::Retracting { pending } = &mut self.mode {
            pending[axis.index()] = true;
            let now = self.clock.now_monotonic();
            self.axes[axis.index()].reset(now);
            self.planner.status = MachineStatus::Homing;
            return Ok(());
        }
        let mut pending = [false; 4];
        pending[axis.index()] = true;
        self.start_mode(SupervisorMode::Retracting { pending });
        Ok(())
    }

    pub fn extend_all(&mut self) -> Result<(), CommandError> {
        self.ensure_not_alarm("extend_all")?;
        self.ensure_homed("extend_all")?;
        let top = [0.0, 0.0, 0.0];
        let bottom = [0.0, self.extend_lower_offset, 0.0];
        let targets = AxisId::ALL.map(|axis| {
            let point = if axis.is_top() { &top } else { &bottom };
            self.geometry.belt_length(axis, point)
        });
        tracing::info!("Extending belts to {:?}", targets);
        self.start_mode(SupervisorMode::Extending {
            started: self.clock.now_monotonic(),
            targets,
            done: [false; 4],
        });
        Ok(())
    }

    pub fn comply_all(&mut self) -> Result<(), CommandError> {
        self.ensure_not_alarm("comply_all")?;
        self.start_mode(SupervisorMode::Complying {
            started: self.clock.now_monotonic(),
        });
        Ok(())
    }

    /// Takes the slack out of all four belts without moving the datum.
    pub fn pull_tight_all(&mut self) -> Result<(), CommandError> {
        self.ensure_not_alarm("pull_tight")?;
        self.start_mode(SupervisorMode::Tightening { done: [false; 4] });
        Ok(())
    }

    pub fn calibrate(&mut self) -> Result<(), CommandError> {
        self.ensure_not_alarm("calibrate")?;
        self.ensure_homed("calibrate")?;
        for (dimension, value) in [("width", self.frame_width), ("height", self.frame_height)] {
            if !frame_dimension_in_range(value) {
                return self.reject("calibrate", CommandError::FrameOutOfRange { dimension, value });
            }
        }
        let offset = self.calibration_config.grid_offset;
        if offset >= self.frame_width / 2.0 || offset >= self.frame_height / 2.0 {
            return self.reject(
                "calibrate",
                CommandError::InvalidArgument(format!(
                    "grid offset {} mm leaves no grid in a {}x{} mm frame",
                    offset, self.frame_width, self.frame_height
                )),
            );
        }
        let engine = CalibrationEngine::new(&self.calibration_config, self.orientation, &self.geometry);
        tracing::info!("Starting calibration over {} points", engine.grid().len());
        self.telemetry.record(TelemetryKind::CalibrationGrid {
            points: engine.grid().to_vec(),
        });
        self.start_mode(SupervisorMode::Calibrating(Box::new(engine)));
        Ok(())
    }

    /// Stops every motor and bulk mode without raising an alarm. Also clears an alarm.
    pub fn stop(&mut self) {
        let now = self.clock.now_monotonic();
        for axis in self.axes.iter_mut() {
            axis.stop();
            axis.reset(now);
        }
        self.set_mode(SupervisorMode::Idle);
        self.hold_until = None;
        self.planner.status = MachineStatus::Idle;
        tracing::info!("All motion stopped");
        self.update_fan();
    }

    pub fn set_frame_width(&mut self, value: f64) -> Result<(), CommandError> {
        self.ensure_not_calibrating("set_frame_width")?;
        if !frame_dimension_in_range(value) {
            return self.reject("set_frame_width", CommandError::FrameOutOfRange { dimension: "width", value });
        }
        self.frame_width = value;
        self.geometry.update_frame_xyz(self.frame_width, self.frame_height);
        tracing::info!("Frame width set to {} mm", value);
        Ok(())
    }

    pub fn set_frame_height(&mut self, value: f64) -> Result<(), CommandError> {
        self.ensure_not_calibrating("set_frame_height")?;
        if !frame_dimension_in_range(value) {
            return self.reject("set_frame_height", CommandError::FrameOutOfRange { dimension: "height", value });
        }
        self.frame_height = value;
        self.geometry.update_frame_xyz(self.frame_width, self.frame_height);
        tracing::info!("Frame height set to {} mm", value);
        Ok(())
    }

    pub fn set_safety_enabled(&mut self, enabled: bool) {
        if enabled {
            tracing::info!("Safety checks enabled");
        } else {
            tracing::warn!("Safety checks disabled");
        }
        self.safety_enabled = enabled;
    }

    /// Points the machine at `target` (center-relative) and switches the status to Jog.
    pub fn jog(&mut self, target: [f64; 3]) -> Result<(), CommandError> {
        self.ensure_not_alarm("jog")?;
        if !self.geometry.is_valid_position(&target) {
            return self.reject(
                "jog",
                CommandError::InvalidArgument(format!("target {:?} is outside the frame", target)),
            );
        }
        self.planner.target = target;
        self.planner.status = MachineStatus::Jog;
        Ok(())
    }

    /// Unconditional fail-safe stop: motors off, every mode cleared, status Alarm.
    /// Safe to call repeatedly.
    pub fn panic(&mut self, fault: FaultKind) {
        let now = self.clock.now_monotonic();
        for axis in self.axes.iter_mut() {
            axis.stop();
            axis.reset(now);
        }
        self.set_mode(SupervisorMode::Idle);
        self.hold_until = None;
        self.planner.status = MachineStatus::Alarm;
        self.panic_count += 1;
        tracing::error!("PANIC: {}. All motors stopped", fault);
        self.telemetry.record(TelemetryKind::Panic {
            fault: fault.to_string(),
        });
        self.last_fault = Some(fault);
        self.update_fan();
    }

    /// One control cycle. Never blocks.
    pub fn tick(&mut self) {
        let now = self.clock.now_monotonic();
        if let Some(last) = self.last_tick {
            let gap = now.saturating_duration_since(last);
            if gap > self.safety.config().liveness_timeout() {
                self.last_tick = Some(now);
                self.panic(FaultKind::Liveness {
                    elapsed_ms: gap.as_millis() as u64,
                });
                return;
            }
        }
        self.last_tick = Some(now);

        let mut reads = [true; 4];
        for (ok, axis) in reads.iter_mut().zip(self.axes.iter_mut()) {
            *ok = axis.update_encoder_position();
        }
        if let Some(fault) = self.safety.tally_encoders(reads, now) {
            self.panic(fault);
            return;
        }
        for axis in self.axes.iter_mut() {
            axis.update(now);
        }

        if self.safety_enabled {
            let report = self.safety.check(&self.axes, self.planner.status, now);
            for flag in report.flags {
                self.telemetry.record(TelemetryKind::SafetyFlag {
                    axis: Some(flag.axis),
                    reason: flag.reason,
                });
            }
            if let Some(fault) = report.fault {
                self.panic(fault);
                return;
            }
        }
        self.update_fan();

        if let Some(until) = self.hold_until {
            if now < until {
                return;
            }
            self.hold_until = None;
        }

        match self.planner.status {
            MachineStatus::Homing => self.run_homing(now),
            MachineStatus::Jog | MachineStatus::Cycle => self.run_motion(now),
            _ => self.stop_motors(),
        }
    }

    fn run_homing(&mut self, now: Instant) {
        let mut finished = false;
        let mut report = None;
        match &mut self.mode {
            SupervisorMode::Idle => finished = true,
            SupervisorMode::Retracting { pending } => {
                for axis in AxisId::ALL {
                    let i = axis.index();
                    if pending[i] && self.axes[i].retract(now) {
                        pending[i] = false;
                        self.axes[i].set_homed(true);
                        tracing::info!("{} retracted and homed", axis);
                        self.telemetry.record(TelemetryKind::AxisHomed { axis });
                    }
                }
                finished = pending.iter().all(|p| !p);
            }
            SupervisorMode::Extending { started, targets, done } => {
                let elapsed = now.saturating_duration_since(*started);
                if elapsed < DECOMPRESS_WINDOW {
                    decompress_staggered(&mut self.axes, elapsed);
                } else {
                    for axis in AxisId::ALL {
                        let i = axis.index();
                        if !done[i] {
                            done[i] = self.axes[i].extend(targets[i], now);
                        }
                    }
                    finished = done.iter().all(|d| *d);
                }
            }
            SupervisorMode::Complying { started } => {
                let elapsed = now.saturating_duration_since(*started);
                if elapsed < DECOMPRESS_WINDOW {
                    decompress_staggered(&mut self.axes, elapsed);
                } else {
                    for axis in self.axes.iter_mut() {
                        axis.comply(now);
                    }
                }
            }
            SupervisorMode::Tightening { done } => {
                for axis in AxisId::ALL {
                    let i = axis.index();
                    if !done[i] {
                        done[i] = self.axes[i].pull_tight(now);
                    }
                }
                finished = done.iter().all(|d| *d);
            }
            SupervisorMode::Calibrating(engine) => {
                match engine.step(&mut self.axes, &self.geometry, &mut self.telemetry, now) {
                    CalibrationStep::Working => {}
                    CalibrationStep::Hold(duration) => self.hold_until = Some(now + duration),
                    CalibrationStep::Finished(result) => {
                        report = Some(result);
                        finished = true;
                    }
                    CalibrationStep::Aborted(reason) => {
                        tracing::warn!("Calibration aborted, geometry unchanged: {}", reason);
                        finished = true;
                    }
                }
            }
        }
        if let Some(report) = report {
            self.apply_calibration(report);
        }
        if finished {
            self.finish_mode(now);
        }
    }

    fn run_motion(&mut self, now: Instant) {
        let lengths = self.geometry.cartesian_to_motors(&self.planner.target);
        for (axis, length) in self.axes.iter_mut().zip(lengths) {
            axis.set_target(length);
        }
        // An axis without a datum would fight the others.
        if !self.all_homed() {
            self.stop_motors();
            return;
        }
        for axis in self.axes.iter_mut() {
            axis.recompute_pid(None);
        }
        self.poll_servo_fault(now);
    }

    fn apply_calibration(&mut self, report: CalibrationReport) {
        match (&report.fit, report.accepted) {
            (Some(fit), true) => {
                self.geometry.set_anchors(fit.anchors);
                let [tl, tr, bl, br] = fit.anchors;
                self.frame_width = ((tr.x - tl.x) + (br.x - bl.x)) / 2.0;
                self.frame_height = ((tl.y - bl.y) + (tr.y - br.y)) / 2.0;
                tracing::info!(
                    "Calibration accepted (fit error {:.3} mm, {} iterations): TL ({:.1}, {:.1}) TR ({:.1}, {:.1}) BR x {:.1}",
                    fit.fit_error,
                    fit.iterations,
                    fit.anchors[0].x,
                    fit.anchors[0].y,
                    fit.anchors[1].x,
                    fit.anchors[1].y,
                    fit.anchors[3].x
                );
            }
            _ => {
                tracing::warn!(
                    "Calibration not accepted ({}), keeping previous geometry",
                    report.reason.as_deref().unwrap_or("no fit")
                );
            }
        }
    }

    fn poll_servo_fault(&mut self, now: Instant) {
        let Some(board) = self.board.as_mut() else {
            return;
        };
        if !board.servo_fault() {
            return;
        }
        let window = self.safety.config().trip_window();
        let due = self
            .last_servo_warning
            .is_none_or(|last| now.saturating_duration_since(last) >= window);
        if due {
            self.last_servo_warning = Some(now);
            tracing::warn!("Servo driver reports a fault");
            self.telemetry.record(TelemetryKind::SafetyFlag {
                axis: None,
                reason: "servo fault input asserted".to_string(),
            });
        }
    }

    fn update_fan(&mut self) {
        let on = !matches!(self.planner.status, MachineStatus::Idle | MachineStatus::Alarm) || !self.mode.is_idle();
        if let Some(board) = self.board.as_mut() {
            board.set_cooling_fan(on);
        }
    }

    fn stop_motors(&mut self) {
        for axis in self.axes.iter_mut() {
            axis.stop();
        }
    }

    fn start_mode(&mut self, mode: SupervisorMode) {
        let now = self.clock.now_monotonic();
        for axis in self.axes.iter_mut() {
            axis.reset(now);
        }
        self.hold_until = None;
        self.set_mode(mode);
        self.planner.status = MachineStatus::Homing;
        self.update_fan();
    }

    fn finish_mode(&mut self, now: Instant) {
        for axis in self.axes.iter_mut() {
            axis.stop();
            axis.reset(now);
        }
        self.set_mode(SupervisorMode::Idle);
        if self.planner.status == MachineStatus::Homing {
            self.planner.status = MachineStatus::Idle;
        }
        self.update_fan();
    }

    fn set_mode(&mut self, mode: SupervisorMode) {
        let from = self.mode.name();
        let to = mode.name();
        self.mode = mode;
        if from != to {
            tracing::info!("Mode {} -> {}", from, to);
            self.telemetry.record(TelemetryKind::ModeChanged {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }

    fn ensure_not_alarm(&mut self, command: &str) -> Result<(), CommandError> {
        if self.planner.status == MachineStatus::Alarm {
            return self.reject(command, CommandError::InAlarm);
        }
        Ok(())
    }

    /// The running grid and starting anchors were taken from the frame size.
    fn ensure_not_calibrating(&mut self, command: &str) -> Result<(), CommandError> {
        if self.mode.calibration().is_some() {
            return self.reject(command, CommandError::Busy("calibrating"));
        }
        Ok(())
    }

    fn ensure_homed(&mut self, command: &str) -> Result<(), CommandError> {
        let missing: Vec<&str> = self
            .axes
            .iter()
            .filter(|axis| !axis.is_homed())
            .map(|axis| axis.id().label())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.reject(command, CommandError::NotHomed(missing.join(", ")))
    }

    /// Refuses a command: status back to Idle (an alarm or a running calibration
    /// stays), reason logged and recorded.
    fn reject(&mut self, command: &str, error: CommandError) -> Result<(), CommandError> {
        if !matches!(error, CommandError::InAlarm | CommandError::Busy(_)) {
            self.planner.status = MachineStatus::Idle;
        }
        tracing::warn!("Rejected {}: {}", command, error);
        self.telemetry.record(TelemetryKind::CommandRejected {
            command: command.to_string(),
            reason: error.to_string(),
        });
        Err(error)
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let axes = self
            .axes
            .iter()
            .map(|axis| AxisSnapshot {
                axis: axis.id(),
                homed: axis.is_homed(),
                position: axis.position(),
                target: axis.target(),
                error: axis.position_error(),
                current: axis.motor_current(),
                speed: axis.belt_speed(),
                power: axis.motor_power(),
            })
            .collect();
        let calibration = self.mode.calibration().map(|engine| CalibrationProgress {
            waypoint: engine.waypoint(),
            total: engine.grid().len(),
            phase: engine.phase_name(),
            failed_batches: engine.failed_batches(),
        });
        let sled_estimate = if self.all_homed() {
            let positions = AxisId::ALL.map(|axis| self.axes[axis.index()].position());
            match self.geometry.motors_to_cartesian(&positions) {
                Ok(point) => Some(point),
                Err(e) => {
                    tracing::trace!("No sled estimate: {}", e);
                    None
                }
            }
        } else {
            None
        };
        SupervisorSnapshot {
            status: self.planner.status,
            mode: self.mode.name(),
            planner_target: self.planner.target,
            axes,
            anchors: self.geometry.anchors(),
            center: self.geometry.center(),
            frame_width: self.frame_width,
            frame_height: self.frame_height,
            sled_estimate,
            safety_enabled: self.safety_enabled,
            panic_count: self.panic_count,
            last_fault: self.last_fault.as_ref().map(|f| f.to_string()),
            calibration,
        }
    }
}

/// Each axis pays out at full speed from its offset until the end of the window.
fn decompress_staggered(axes: &mut [AxisUnit; 4], elapsed: Duration) {
    for axis in axes.iter_mut() {
        if elapsed >= decompress_offset(axis.id()) {
            axis.decompress_belt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cablebot_simulator::{axis_devices, lock_plant, PlantConfig, SharedPlant, SimBoard, SimClock, WinchPlant};

    struct Bench {
        clock: SimClock,
        plant: SharedPlant,
        supervisor: MotionSupervisor,
    }

    impl Bench {
        fn new(payout: f64) -> Self {
            let config = Config::default();
            let clock = SimClock::new();
            let plant = WinchPlant::new(PlantConfig::from_config(&config).with_noise(0.0).with_initial_payout(payout)).shared();
            let axes = AxisId::ALL.map(|id| {
                let (encoder, motor) = axis_devices(&plant, id);
                AxisUnit::new(id, &config.axis, encoder, motor)
            });
            let supervisor = MotionSupervisor::new(&config, Arc::new(clock.clone()), axes)
                .with_board(Box::new(SimBoard::new(plant.clone())));
            Self { clock, plant, supervisor }
        }

        fn tick(&mut self) {
            let dt = Duration::from_millis(5);
            self.clock.advance(dt);
            lock_plant(&self.plant).step(dt);
            self.supervisor.tick();
        }
    }

    #[test]
    fn retract_one_axis_homes_only_that_axis() {
        let mut bench = Bench::new(4.0);
        bench.supervisor.retract_axis(AxisId::TopRight).unwrap();
        assert_eq!(bench.supervisor.status(), MachineStatus::Homing);
        for _ in 0..1000 {
            bench.tick();
            if bench.supervisor.status() == MachineStatus::Idle {
                break;
            }
        }
        assert_eq!(bench.supervisor.status(), MachineStatus::Idle);
        assert!(bench.supervisor.axis(AxisId::TopRight).is_homed());
        assert!(!bench.supervisor.axis(AxisId::TopLeft).is_homed());
        assert_eq!(lock_plant(&bench.plant).payout(AxisId::TopRight), 0.0);
        assert!(bench.supervisor.mode().is_idle());
    }

    #[test]
    fn comply_decompresses_bottom_right_first() {
        let mut bench = Bench::new(100.0);
        bench.supervisor.comply_all().unwrap();
        for _ in 0..20 {
            bench.tick();
        }
        let plant = lock_plant(&bench.plant);
        assert_eq!(plant.pwm(AxisId::BottomRight), 1023);
        assert_eq!(plant.pwm(AxisId::TopLeft), 0);
        assert!(plant.fan_on());
    }

    #[test]
    fn frame_setters_validate_and_recenter() {
        let mut bench = Bench::new(100.0);
        bench.supervisor.set_frame_width(2400.0).unwrap();
        assert_eq!(bench.supervisor.geometry().center(), [1200.0, 1000.0]);
        let err = bench.supervisor.set_frame_height(15001.0).unwrap_err();
        assert!(matches!(err, CommandError::FrameOutOfRange { dimension: "height", .. }));
        assert_eq!(bench.supervisor.geometry().height(), 2000.0);
        assert_eq!(bench.supervisor.status(), MachineStatus::Idle);
    }

    #[test]
    fn frame_cannot_change_under_a_running_calibration() {
        let mut bench = Bench::new(100.0);
        for axis in bench.supervisor.axes.iter_mut() {
            axis.set_homed(true);
        }
        bench.supervisor.calibrate().unwrap();

        assert_eq!(bench.supervisor.set_frame_width(2500.0), Err(CommandError::Busy("calibrating")));
        assert_eq!(bench.supervisor.set_frame_height(1500.0), Err(CommandError::Busy("calibrating")));
        assert_eq!(bench.supervisor.status(), MachineStatus::Homing);
        assert_eq!(bench.supervisor.mode().name(), "calibrating");
        assert_eq!(bench.supervisor.geometry().width(), 3000.0);

        bench.supervisor.stop();
        assert!(bench.supervisor.set_frame_width(2500.0).is_ok());
    }

    #[test]
    fn commands_are_refused_in_alarm_until_stop() {
        let mut bench = Bench::new(100.0);
        bench.supervisor.execute(SupervisorCommand::Estop).unwrap();
        assert_eq!(bench.supervisor.status(), MachineStatus::Alarm);
        assert_eq!(bench.supervisor.comply_all(), Err(CommandError::InAlarm));
        assert_eq!(bench.supervisor.status(), MachineStatus::Alarm);
        bench.supervisor.execute(SupervisorCommand::Stop).unwrap();
        assert_eq!(bench.supervisor.status(), MachineStatus::Idle);
        assert!(bench.supervisor.comply_all().is_ok());
    }

    #[test]
    fn unknown_axis_name_is_rejected() {
        let mut bench = Bench::new(100.0);
        let result = bench.supervisor.execute(SupervisorCommand::RetractAxis { axis: "middle".to_string() });
        assert!(matches!(result, Err(CommandError::InvalidArgument(_))));
        assert!(matches!(
            bench.supervisor.telemetry().last().map(|e| &e.kind),
            Some(TelemetryKind::CommandRejected { .. })
        ));
    }

    /// Feeds a whole grid of synthetic lengths through an engine started from the
    /// supervisor's geometry. `wobble` is added to TL on even points and taken off on odd.
    fn finished_report(supervisor: &mut MotionSupervisor, truth: [Point3; 4], wobble: f64) -> CalibrationReport {
        let geometry = supervisor.geometry().clone();
        let mut engine = CalibrationEngine::new(&CalibrationConfig::default(), Orientation::Horizontal, &geometry);
        let [cx, cy] = geometry.center();
        let grid = engine.grid().to_vec();
        let mut last = CalibrationStep::Working;
        for (n, point) in grid.iter().enumerate() {
            let sled = Point3::new(point[0] + cx, point[1] + cy, 0.0);
            let mut lengths = truth.map(|anchor| anchor.distance_to(&sled));
            lengths[0] += if n % 2 == 0 { wobble } else { -wobble };
            for _ in 0..7 {
                last = engine.record_sample(lengths, supervisor.telemetry_mut());
            }
        }
        match last {
            CalibrationStep::Finished(report) => report,
            other => panic!("calibration did not finish: {:?}", other),
        }
    }

    #[test]
    fn accepted_fit_replaces_the_geometry() {
        let mut bench = Bench::new(100.0);
        let truth = [
            Point3::new(4.0, 2006.0, 0.0),
            Point3::new(2995.0, 2010.0, 0.0),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2998.0, 0.0, 0.0),
        ];
        let report = finished_report(&mut bench.supervisor, truth, 0.0);
        assert!(report.accepted);

        bench.supervisor.apply_calibration(report);

        let geometry = bench.supervisor.geometry();
        for (fitted, expected) in geometry.anchors().iter().zip(truth.iter()) {
            assert!(fitted.distance_to(expected) < 0.01, "{:?} vs {:?}", fitted, expected);
        }
        assert_ne!(geometry.center(), [1500.0, 1000.0]);
        let snapshot = bench.supervisor.snapshot();
        assert!((snapshot.frame_width - 2994.5).abs() < 0.01);
        assert!((snapshot.frame_height - 2008.0).abs() < 0.01);
        assert!(matches!(
            bench.supervisor.telemetry().last().map(|e| &e.kind),
            Some(TelemetryKind::CalibrationFinished { accepted: true, anchors: Some(_), .. })
        ));
    }

    #[test]
    fn rejected_fit_keeps_the_geometry() {
        let mut bench = Bench::new(100.0);
        let before = bench.supervisor.geometry().clone();
        let report = finished_report(&mut bench.supervisor, before.anchors(), 10.0);
        assert!(!report.accepted);
        assert!(report.fit.as_ref().is_none_or(|fit| fit.fit_error >= 2.0));

        bench.supervisor.apply_calibration(report);

        assert_eq!(bench.supervisor.geometry(), &before);
        let snapshot = bench.supervisor.snapshot();
        assert_eq!(snapshot.frame_width, 3000.0);
        assert_eq!(snapshot.frame_height, 2000.0);
        assert!(matches!(
            bench.supervisor.telemetry().last().map(|e| &e.kind),
            Some(TelemetryKind::CalibrationFinished { accepted: false, anchors: None, data, .. }) if data.len() == 35
        ));
    }

    #[test]
    fn sled_estimate_needs_a_datum() {
        let mut bench = Bench::new(100.0);
        assert!(bench.supervisor.snapshot().sled_estimate.is_none());
        for axis in bench.supervisor.axes.iter_mut() {
            axis.set_homed(true);
        }
        // Zero-length top belts cannot reach across the frame.
        assert!(bench.supervisor.snapshot().sled_estimate.is_none());
    }

    #[test]
    fn commands_parse_from_tagged_json() {
        let command: SupervisorCommand = serde_json::from_str(r#"{"command":"set_frame_width","value":2500}"#).unwrap();
        assert_eq!(command, SupervisorCommand::SetFrameWidth { value: 2500.0 });
        let command: SupervisorCommand = serde_json::from_str(r#"{"command":"retract_axis","axis":"bl"}"#).unwrap();
        assert_eq!(command.name(), "retract_axis");
    }
}
