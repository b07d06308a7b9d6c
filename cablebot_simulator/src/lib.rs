//! Simulated winch hardware: plant model, devices, clock and CSV tracing.

pub mod simulator;
pub mod trace;

pub use simulator::clock::SimClock;
pub use simulator::devices::{axis_devices, SimBoard, SimEncoder, SimMotor};
pub use simulator::{lock_plant, PlantConfig, SharedPlant, WinchPlant};
