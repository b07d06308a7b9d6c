// src/motion/kinematics.rs
//! Four-anchor belt kinematics.
//!
//! Targets are given relative to the frame center; anchors live in frame coordinates
//! with the bottom-left anchor at the origin.

use cablebot_shared::config::FrameConfig;
use cablebot_shared::{AxisId, Point3};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum KinematicsError {
    #[error("belt lengths do not meet at a point: {0}")]
    Unreachable(String),
}

/// Kinematics handler for a belt-suspended sled
pub trait Kinematics {
    /// Convert a target position to the four belt lengths
    fn cartesian_to_motors(&self, cartesian: &[f64; 3]) -> [f64; 4];

    /// Recover the sled position from the belt lengths
    fn motors_to_cartesian(&self, motors: &[f64; 4]) -> Result<[f64; 3], KinematicsError>;

    /// Check if position is inside the frame
    fn is_valid_position(&self, cartesian: &[f64; 3]) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameGeometry {
    anchors: [Point3; 4],
    center: [f64; 2],
    belt_end_extension: f64,
    arm_length: f64,
    lower_belt_slack: f64,
}

impl FrameGeometry {
    pub fn from_config(frame: &FrameConfig) -> Self {
        let mut geometry = Self {
            anchors: [Point3::default(); 4],
            center: [0.0, 0.0],
            belt_end_extension: frame.belt_end_extension,
            arm_length: frame.arm_length,
            lower_belt_slack: frame.lower_belt_slack,
        };
        match &frame.anchors {
            Some(a) => geometry.set_anchors([a.top_left, a.top_right, a.bottom_left, a.bottom_right]),
            None => geometry.update_frame_xyz(frame.width, frame.height),
        }
        geometry
    }

    /// Regenerates a rectangular frame with the bottom-left anchor at the origin.
    pub fn update_frame_xyz(&mut self, width: f64, height: f64) {
        self.anchors = [
            Point3::new(0.0, height, 0.0),
            Point3::new(width, height, 0.0),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(width, 0.0, 0.0),
        ];
        self.update_center_xy();
    }

    pub fn anchor(&self, axis: AxisId) -> Point3 {
        self.anchors[axis.index()]
    }

    pub fn anchors(&self) -> [Point3; 4] {
        self.anchors
    }

    pub fn set_anchor(&mut self, axis: AxisId, anchor: Point3) {
        self.anchors[axis.index()] = anchor;
        self.update_center_xy();
    }

    pub fn set_anchors(&mut self, anchors: [Point3; 4]) {
        self.anchors = anchors;
        self.update_center_xy();
    }

    pub fn center(&self) -> [f64; 2] {
        self.center
    }

    /// Belt end extension plus arm length.
    pub fn belt_offset(&self) -> f64 {
        self.belt_end_extension + self.arm_length
    }

    pub fn lower_belt_slack(&self) -> f64 {
        self.lower_belt_slack
    }

    pub fn width(&self) -> f64 {
        self.anchor(AxisId::BottomRight).x - self.anchor(AxisId::BottomLeft).x
    }

    pub fn height(&self) -> f64 {
        self.anchor(AxisId::TopLeft).y - self.anchor(AxisId::BottomLeft).y
    }

    /// Intersects the TL-BR and TR-BL diagonals.
    pub fn update_center_xy(&mut self) {
        let tl = self.anchor(AxisId::TopLeft);
        let tr = self.anchor(AxisId::TopRight);
        let bl = self.anchor(AxisId::BottomLeft);
        let br = self.anchor(AxisId::BottomRight);

        // p = bl + t (tr - bl), q = tl + s (br - tl)
        let d1 = (tr.x - bl.x, tr.y - bl.y);
        let d2 = (br.x - tl.x, br.y - tl.y);
        let denom = d1.0 * d2.1 - d1.1 * d2.0;
        if denom.abs() < 1e-9 {
            tracing::warn!("Frame diagonals are parallel, using the anchor centroid as center");
            self.center = [
                (tl.x + tr.x + bl.x + br.x) / 4.0,
                (tl.y + tr.y + bl.y + br.y) / 4.0,
            ];
            return;
        }
        let t = ((tl.x - bl.x) * d2.1 - (tl.y - bl.y) * d2.0) / denom;
        self.center = [bl.x + t * d1.0, bl.y + t * d1.1];
    }

    /// Belt length for `axis` with the sled at `target` (center-relative).
    pub fn belt_length(&self, axis: AxisId, target: &[f64; 3]) -> f64 {
        let sled = Point3::new(target[0] + self.center[0], target[1] + self.center[1], target[2]);
        let length = self.anchor(axis).distance_to(&sled) - self.belt_offset();
        if axis.is_top() {
            length
        } else {
            length + self.lower_belt_slack
        }
    }
}

impl Kinematics for FrameGeometry {
    fn cartesian_to_motors(&self, cartesian: &[f64; 3]) -> [f64; 4] {
        AxisId::ALL.map(|axis| self.belt_length(axis, cartesian))
    }

    /// Uses the two top belts; the sled hangs below them.
    fn motors_to_cartesian(&self, motors: &[f64; 4]) -> Result<[f64; 3], KinematicsError> {
        let tl = self.anchor(AxisId::TopLeft);
        let tr = self.anchor(AxisId::TopRight);
        let r1 = planar_radius(motors[AxisId::TopLeft.index()] + self.belt_offset(), tl.z);
        let r2 = planar_radius(motors[AxisId::TopRight.index()] + self.belt_offset(), tr.z);
        let dx = tr.x - tl.x;
        let dy = tr.y - tl.y;
        let d = (dx * dx + dy * dy).sqrt();
        if d == 0.0 || d > r1 + r2 || d < (r1 - r2).abs() {
            return Err(KinematicsError::Unreachable(format!(
                "top belts {:.1} and {:.1} over a {:.1} span",
                r1, r2, d
            )));
        }
        let a = (r1 * r1 - r2 * r2 + d * d) / (2.0 * d);
        let h = (r1 * r1 - a * a).max(0.0).sqrt();
        let mx = tl.x + a * dx / d;
        let my = tl.y + a * dy / d;
        // Right-hand normal of TL->TR points down for a level frame.
        let x = mx + h * dy / d;
        let y = my - h * dx / d;
        Ok([x - self.center[0], y - self.center[1], 0.0])
    }

    fn is_valid_position(&self, cartesian: &[f64; 3]) -> bool {
        let x = cartesian[0] + self.center[0];
        let y = cartesian[1] + self.center[1];
        let min_x = self.anchors.iter().map(|a| a.x).fold(f64::INFINITY, f64::min);
        let max_x = self.anchors.iter().map(|a| a.x).fold(f64::NEG_INFINITY, f64::max);
        let min_y = self.anchors.iter().map(|a| a.y).fold(f64::INFINITY, f64::min);
        let max_y = self.anchors.iter().map(|a| a.y).fold(f64::NEG_INFINITY, f64::max);
        (min_x..=max_x).contains(&x) && (min_y..=max_y).contains(&y)
    }
}

fn planar_radius(length: f64, dz: f64) -> f64 {
    (length * length - dz * dz).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: f64, height: f64) -> FrameGeometry {
        let config = FrameConfig {
            width,
            height,
            ..FrameConfig::default()
        };
        FrameGeometry::from_config(&config)
    }

    #[test]
    fn rectangular_center_is_the_midpoint() {
        let geometry = frame(3000.0, 2000.0);
        assert_eq!(geometry.center(), [1500.0, 1000.0]);
        let lengths = geometry.cartesian_to_motors(&[0.0, 0.0, 0.0]);
        let expected = (1500.0_f64.hypot(1000.0)) - 153.4;
        for length in lengths {
            assert!((length - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn lengths_at_center_match_anchor_distance() {
        let mut geometry = frame(3000.0, 2000.0);
        geometry.set_anchors([
            Point3::new(-12.0, 2031.0, 0.0),
            Point3::new(2987.0, 1992.0, 0.0),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(3010.0, 0.0, 0.0),
        ]);
        let [cx, cy] = geometry.center();
        let center = Point3::new(cx, cy, 0.0);
        for axis in [AxisId::BottomRight, AxisId::TopLeft, AxisId::BottomLeft, AxisId::TopRight] {
            let expected = geometry.anchor(axis).distance_to(&center) - geometry.belt_offset();
            assert!((geometry.belt_length(axis, &[0.0, 0.0, 0.0]) - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn center_follows_anchor_mutation() {
        let mut geometry = frame(3000.0, 2000.0);
        geometry.set_anchor(AxisId::TopRight, Point3::new(3000.0, 2600.0, 0.0));
        let [cx, cy] = geometry.center();
        // On the BL-TR diagonal and on the TL-BR diagonal.
        assert!((cy - cx * 2600.0 / 3000.0).abs() < 1e-9);
        assert!((cy - (2000.0 - cx * 2000.0 / 3000.0)).abs() < 1e-9);
        assert_ne!(geometry.center(), [1500.0, 1000.0]);
    }

    #[test]
    fn resizing_regenerates_anchors() {
        let mut geometry = frame(3000.0, 2000.0);
        geometry.update_frame_xyz(2400.0, 1200.0);
        assert_eq!(geometry.anchor(AxisId::TopRight), Point3::new(2400.0, 1200.0, 0.0));
        assert_eq!(geometry.center(), [1200.0, 600.0]);
        assert_eq!(geometry.width(), 2400.0);
        assert_eq!(geometry.height(), 1200.0);
    }

    #[test]
    fn lower_belt_slack_only_affects_bottom_belts() {
        let config = FrameConfig {
            lower_belt_slack: 4.0,
            ..FrameConfig::default()
        };
        let slack = FrameGeometry::from_config(&config);
        let plain = frame(config.width, config.height);
        let target = [100.0, -50.0, 0.0];
        assert_eq!(slack.belt_length(AxisId::TopLeft, &target), plain.belt_length(AxisId::TopLeft, &target));
        assert!((slack.belt_length(AxisId::BottomRight, &target) - plain.belt_length(AxisId::BottomRight, &target) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn top_belts_recover_the_target() {
        let geometry = frame(3000.0, 2000.0);
        let target = [-220.0, 310.0, 0.0];
        let lengths = geometry.cartesian_to_motors(&target);
        let recovered = geometry.motors_to_cartesian(&lengths).unwrap();
        assert!((recovered[0] - target[0]).abs() < 1e-6);
        assert!((recovered[1] - target[1]).abs() < 1e-6);
        assert!(geometry.motors_to_cartesian(&[1.0, 1.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn validity_is_bounded_by_the_anchors() {
        let geometry = frame(3000.0, 2000.0);
        assert!(geometry.is_valid_position(&[0.0, 0.0, 0.0]));
        assert!(geometry.is_valid_position(&[1500.0, -1000.0, 0.0]));
        assert!(!geometry.is_valid_position(&[1600.0, 0.0, 0.0]));
    }
}
