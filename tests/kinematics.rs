//! Frame geometry as the binaries see it: loaded from TOML, then resized at runtime.

use cablebot_rs::config::{load_or_default, Config};
use cablebot_rs::motion::{FrameGeometry, Kinematics};
use cablebot_rs::simulation::SimRig;
use cablebot_shared::{AxisId, Point3};
use std::io::Write;
use tempfile::NamedTempFile;

const OFFSET: f64 = 153.4;

#[test]
fn lengths_at_center_of_default_frame() {
    let geometry = FrameGeometry::from_config(&Config::default().frame);
    assert_eq!(geometry.center(), [1500.0, 1000.0]);
    let expected = 1500.0_f64.hypot(1000.0) - OFFSET;
    for length in geometry.cartesian_to_motors(&[0.0, 0.0, 0.0]) {
        assert!((length - expected).abs() < 1e-9);
    }
}

#[test]
fn measured_anchors_from_config_drive_the_center() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[frame]
width = 3000.0
height = 2000.0

[frame.anchors]
top_left = {{ x = -8.0, y = 2021.0 }}
top_right = {{ x = 3004.0, y = 1995.0 }}
bottom_left = {{ x = 0.0, y = 0.0 }}
bottom_right = {{ x = 2990.0, y = 0.0 }}
"#
    )
    .unwrap();
    let config = load_or_default(file.path().to_str().unwrap()).unwrap();
    let geometry = FrameGeometry::from_config(&config.frame);

    assert_eq!(geometry.anchor(AxisId::TopLeft), Point3::new(-8.0, 2021.0, 0.0));
    let [cx, cy] = geometry.center();
    assert_ne!([cx, cy], [1500.0, 1000.0]);
    let center = Point3::new(cx, cy, 0.0);
    for axis in AxisId::ALL {
        let expected = geometry.anchor(axis).distance_to(&center) - OFFSET;
        assert!((geometry.belt_length(axis, &[0.0, 0.0, 0.0]) - expected).abs() < 1e-9);
    }
}

#[test]
fn supervisor_resize_moves_the_center() {
    let config = Config::default();
    let mut rig = SimRig::from_config(&config);
    rig.supervisor.set_frame_width(2400.0).unwrap();
    rig.supervisor.set_frame_height(1600.0).unwrap();
    let geometry = rig.supervisor.geometry();
    assert_eq!(geometry.center(), [1200.0, 800.0]);
    assert_eq!(geometry.anchor(AxisId::BottomRight), Point3::new(2400.0, 0.0, 0.0));
    let snapshot = rig.supervisor.snapshot();
    assert_eq!(snapshot.frame_width, 2400.0);
    assert_eq!(snapshot.frame_height, 1600.0);
}

#[test]
fn jog_outside_the_frame_is_refused() {
    let config = Config::default();
    let mut rig = SimRig::from_config(&config);
    assert!(rig.supervisor.jog([2000.0, 0.0, 0.0]).is_err());
    assert!(rig.supervisor.jog([100.0, -200.0, 0.0]).is_ok());
    assert_eq!(rig.supervisor.planner().target, [100.0, -200.0, 0.0]);
}
