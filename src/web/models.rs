//! Request and response bodies of the HTTP API.

use serde::{Deserialize, Serialize};

/// Jog target relative to the frame center, in mm.
#[derive(Debug, Deserialize)]
pub struct JogRequest {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub result: &'static str,
}
