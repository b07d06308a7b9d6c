// src/motion/mod.rs - winch axes, belt kinematics and the supervisor

pub mod axis;
pub mod controller;
pub mod kinematics;
pub mod mode;
pub mod pid;

pub use axis::AxisUnit;
pub use controller::{CommandError, MotionSupervisor, SupervisorCommand, SupervisorSnapshot};
pub use kinematics::{FrameGeometry, Kinematics, KinematicsError};
pub use mode::SupervisorMode;
