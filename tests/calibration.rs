//! Starting, observing and cancelling a calibration through the supervisor.

use cablebot_rs::config::Config;
use cablebot_rs::motion::CommandError;
use cablebot_rs::simulation::SimRig;
use cablebot_rs::telemetry::TelemetryKind;
use cablebot_shared::MachineStatus;
use cablebot_simulator::{lock_plant, PlantConfig};
use std::time::Duration;

fn homed_rig(config: &Config) -> SimRig {
    let plant = PlantConfig::from_config(config).with_noise(0.0).with_initial_payout(2.0);
    let mut rig = SimRig::new(config, plant);
    rig.supervisor.retract_all().unwrap();
    assert!(rig.run_until(Duration::from_secs(10), |s| s.status() == MachineStatus::Idle));
    assert!(rig.supervisor.all_homed());
    rig
}

#[test]
fn calibration_publishes_its_grid_and_progress() {
    let config = Config::default();
    let mut rig = homed_rig(&config);

    rig.supervisor.calibrate().unwrap();
    assert_eq!(rig.supervisor.status(), MachineStatus::Homing);
    assert_eq!(rig.supervisor.mode().name(), "calibrating");

    let grid = rig
        .supervisor
        .telemetry()
        .iter()
        .find_map(|e| match &e.kind {
            TelemetryKind::CalibrationGrid { points } => Some(points.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(grid.len(), 35);
    assert_eq!(grid[0], [-1000.0, 500.0]);

    rig.run_for(Duration::from_millis(500));
    assert_eq!(rig.supervisor.status(), MachineStatus::Homing);
    let progress = rig.supervisor.snapshot().calibration.unwrap();
    assert_eq!(progress.waypoint, 0);
    assert_eq!(progress.total, 35);
    assert_eq!(progress.phase, "travel");
    assert_eq!(progress.failed_batches, 0);
}

#[test]
fn stop_cancels_calibration_and_keeps_the_geometry() {
    let config = Config::default();
    let mut rig = homed_rig(&config);
    let anchors = rig.supervisor.geometry().anchors();

    rig.supervisor.calibrate().unwrap();
    rig.run_for(Duration::from_millis(200));
    rig.supervisor.stop();

    assert_eq!(rig.supervisor.status(), MachineStatus::Idle);
    assert!(rig.supervisor.mode().is_idle());
    assert!(rig.supervisor.snapshot().calibration.is_none());
    assert_eq!(rig.supervisor.geometry().anchors(), anchors);
}

#[test]
fn out_of_range_frame_is_refused() {
    let mut config = Config::default();
    config.frame.width = 16000.0;
    let mut rig = homed_rig(&config);

    let result = rig.supervisor.calibrate();

    assert!(matches!(
        result,
        Err(CommandError::FrameOutOfRange { dimension: "width", value }) if value == 16000.0
    ));
    assert_eq!(rig.supervisor.status(), MachineStatus::Idle);
    assert!(rig.supervisor.mode().is_idle());
}

#[test]
fn grid_offset_must_leave_room_for_a_grid() {
    let mut config = Config::default();
    config.calibration.grid_offset = 1000.0;
    let mut rig = homed_rig(&config);

    let result = rig.supervisor.calibrate();

    assert!(matches!(result, Err(CommandError::InvalidArgument(_))));
    assert_eq!(rig.supervisor.status(), MachineStatus::Idle);
    assert!(rig.supervisor.mode().is_idle());
    assert!(rig
        .supervisor
        .telemetry()
        .iter()
        .all(|e| !matches!(e.kind, TelemetryKind::CalibrationGrid { .. })));
}

#[test]
fn frame_size_is_locked_while_calibrating() {
    let config = Config::default();
    let mut rig = homed_rig(&config);
    rig.supervisor.calibrate().unwrap();
    rig.run_for(Duration::from_millis(100));

    assert_eq!(rig.supervisor.set_frame_width(2000.0), Err(CommandError::Busy("calibrating")));
    assert_eq!(rig.supervisor.status(), MachineStatus::Homing);

    rig.run_for(Duration::from_millis(100));
    assert_eq!(rig.supervisor.mode().name(), "calibrating");
    assert_eq!(rig.supervisor.snapshot().frame_width, 3000.0);
}

#[test]
fn full_calibration_recovers_the_frame() {
    let config = Config::default();
    let mut rig = homed_rig(&config);
    rig.supervisor.extend_all().unwrap();
    assert!(rig.run_until(Duration::from_secs(60), |s| s.status() == MachineStatus::Idle));
    let [cx, cy] = rig.supervisor.geometry().center();
    lock_plant(&rig.plant).attach(cx, cy);
    let truth = lock_plant(&rig.plant).config().anchors;

    rig.supervisor.calibrate().unwrap();
    assert!(rig.run_until(Duration::from_secs(2 * 3600), |s| s.mode().is_idle()));

    assert_eq!(rig.supervisor.status(), MachineStatus::Idle);
    assert_eq!(rig.supervisor.panic_count(), 0);
    let (accepted, fit_error, anchors, points) = rig
        .supervisor
        .telemetry()
        .iter()
        .find_map(|e| match &e.kind {
            TelemetryKind::CalibrationFinished { accepted, fit_error, anchors, data } => {
                Some((*accepted, *fit_error, *anchors, data.len()))
            }
            _ => None,
        })
        .expect("calibration finished");
    assert_eq!(points, 35);
    assert!(accepted, "fit error {:?}", fit_error);
    assert!(fit_error.is_some_and(|e| e < 2.0), "fit error {:?}", fit_error);

    let anchors = anchors.unwrap();
    for (fitted, expected) in anchors.iter().zip(truth.iter()) {
        assert!(fitted.distance_to(expected) < 2.0, "{:?} vs {:?}", fitted, expected);
    }
    assert_eq!(rig.supervisor.geometry().anchors(), anchors);
    assert!((rig.supervisor.snapshot().frame_width - 3000.0).abs() < 2.0);
}
