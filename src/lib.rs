// src/lib.rs - cable-winch control core, host runtime and simulation rig

pub mod calibration;
pub mod config;
pub mod machine;
pub mod motion;
pub mod safety;
pub mod simulation;
pub mod telemetry;
pub mod web;
