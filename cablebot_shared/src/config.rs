//! Shared configuration logic for the host, the simulator and tests.

use crate::Point3;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const MIN_FRAME_DIMENSION: f64 = 200.0;
pub const MAX_FRAME_DIMENSION: f64 = 15000.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub axis: AxisConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub host: HostConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.frame.validate()?;
        self.axis.validate()?;
        self.calibration.validate()?;
        self.safety.validate()?;
        if self.host.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("host.tick_interval_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AnchorOverrides {
    pub top_left: Point3,
    pub top_right: Point3,
    pub bottom_left: Point3,
    pub bottom_right: Point3,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrameConfig {
    #[serde(default = "default_frame_width")]
    pub width: f64,
    #[serde(default = "default_frame_height")]
    pub height: f64,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default = "default_belt_end_extension")]
    pub belt_end_extension: f64,
    #[serde(default = "default_arm_length")]
    pub arm_length: f64,
    #[serde(default)]
    pub lower_belt_slack: f64,
    #[serde(default)]
    pub anchors: Option<AnchorOverrides>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            width: default_frame_width(),
            height: default_frame_height(),
            orientation: Orientation::default(),
            belt_end_extension: default_belt_end_extension(),
            arm_length: default_arm_length(),
            lower_belt_slack: 0.0,
            anchors: None,
        }
    }
}

impl FrameConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !frame_dimension_in_range(value) {
                return Err(ConfigError::Invalid(format!(
                    "frame.{} must be within [{}, {}], got {}",
                    name, MIN_FRAME_DIMENSION, MAX_FRAME_DIMENSION, value
                )));
            }
        }
        if self.belt_end_extension < 0.0 || self.arm_length < 0.0 {
            return Err(ConfigError::Invalid("belt offsets must be >= 0".to_string()));
        }
        Ok(())
    }
}

pub fn frame_dimension_in_range(value: f64) -> bool {
    (MIN_FRAME_DIMENSION..=MAX_FRAME_DIMENSION).contains(&value)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxisConfig {
    #[serde(default = "default_mm_per_revolution")]
    pub mm_per_revolution: f64,
    #[serde(default = "default_encoder_counts")]
    pub encoder_counts_per_revolution: u32,
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,
    #[serde(default = "default_output_limit")]
    pub output_limit: f64,
    #[serde(default = "default_absolute_current_threshold")]
    pub absolute_current_threshold: f64,
    #[serde(default = "default_incremental_current_threshold")]
    pub incremental_current_threshold: f64,
    #[serde(default = "default_baseline_alpha")]
    pub baseline_alpha: f64,
    #[serde(default = "default_initial_baseline")]
    pub initial_baseline: f64,
    #[serde(default = "default_retract_speed_cap")]
    pub retract_speed_cap: u16,
    #[serde(default = "default_retract_settle_speed")]
    pub retract_settle_speed: u16,
    #[serde(default = "default_comply_floor")]
    pub comply_floor: f64,
    #[serde(default = "default_comply_growth")]
    pub comply_growth: f64,
    #[serde(default = "default_comply_decay")]
    pub comply_decay: f64,
    #[serde(default = "default_comply_interval_ms")]
    pub comply_interval_ms: u64,
    #[serde(default = "default_current_sample_ms")]
    pub current_sample_ms: u64,
    #[serde(default = "default_speed_sample_ms")]
    pub speed_sample_ms: u64,
    #[serde(default = "default_current_buffer_len")]
    pub current_buffer_len: usize,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            mm_per_revolution: default_mm_per_revolution(),
            encoder_counts_per_revolution: default_encoder_counts(),
            kp: default_kp(),
            ki: 0.0,
            kd: 0.0,
            output_limit: default_output_limit(),
            absolute_current_threshold: default_absolute_current_threshold(),
            incremental_current_threshold: default_incremental_current_threshold(),
            baseline_alpha: default_baseline_alpha(),
            initial_baseline: default_initial_baseline(),
            retract_speed_cap: default_retract_speed_cap(),
            retract_settle_speed: default_retract_settle_speed(),
            comply_floor: default_comply_floor(),
            comply_growth: default_comply_growth(),
            comply_decay: default_comply_decay(),
            comply_interval_ms: default_comply_interval_ms(),
            current_sample_ms: default_current_sample_ms(),
            speed_sample_ms: default_speed_sample_ms(),
            current_buffer_len: default_current_buffer_len(),
        }
    }
}

impl AxisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mm_per_revolution <= 0.0 || self.encoder_counts_per_revolution == 0 {
            return Err(ConfigError::Invalid("axis scaling must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.baseline_alpha) {
            return Err(ConfigError::Invalid("axis.baseline_alpha must be between 0 and 1".to_string()));
        }
        if self.comply_growth <= 1.0 || self.comply_decay <= 1.0 {
            return Err(ConfigError::Invalid("comply growth and decay must be > 1".to_string()));
        }
        if self.current_buffer_len == 0 {
            return Err(ConfigError::Invalid("axis.current_buffer_len must be > 0".to_string()));
        }
        Ok(())
    }

    /// Millimetres of belt per encoder count.
    pub fn mm_per_count(&self) -> f64 {
        self.mm_per_revolution / self.encoder_counts_per_revolution as f64
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_grid_offset")]
    pub grid_offset: f64,
    #[serde(default = "default_grid_columns")]
    pub grid_columns: usize,
    #[serde(default = "default_grid_rows")]
    pub grid_rows: usize,
    #[serde(default = "default_discard_samples")]
    pub discard_samples: usize,
    #[serde(default = "default_kept_samples")]
    pub kept_samples: usize,
    #[serde(default = "default_max_deviation")]
    pub max_deviation: f64,
    #[serde(default = "default_max_failed_batches")]
    pub max_failed_batches: u32,
    #[serde(default = "default_travel_speed")]
    pub travel_speed: f64,
    #[serde(default = "default_arrival_tolerance")]
    pub arrival_tolerance: f64,
    #[serde(default = "default_decompress_ms")]
    pub decompress_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
    #[serde(default = "default_fit_threshold")]
    pub fit_threshold: f64,
    #[serde(default = "default_extend_lower_offset")]
    pub extend_lower_offset: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            grid_offset: default_grid_offset(),
            grid_columns: default_grid_columns(),
            grid_rows: default_grid_rows(),
            discard_samples: default_discard_samples(),
            kept_samples: default_kept_samples(),
            max_deviation: default_max_deviation(),
            max_failed_batches: default_max_failed_batches(),
            travel_speed: default_travel_speed(),
            arrival_tolerance: default_arrival_tolerance(),
            decompress_ms: default_decompress_ms(),
            settle_ms: default_settle_ms(),
            hold_ms: default_hold_ms(),
            fit_threshold: default_fit_threshold(),
            extend_lower_offset: default_extend_lower_offset(),
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(100.0..=1500.0).contains(&self.grid_offset) {
            return Err(ConfigError::Invalid(format!(
                "calibration.grid_offset must be within [100, 1500], got {}",
                self.grid_offset
            )));
        }
        if self.grid_columns < 2 || self.grid_rows < 2 {
            return Err(ConfigError::Invalid("calibration grid needs at least 2x2 points".to_string()));
        }
        if self.kept_samples == 0 {
            return Err(ConfigError::Invalid("calibration.kept_samples must be > 0".to_string()));
        }
        if self.travel_speed <= 0.0 || self.arrival_tolerance <= 0.0 {
            return Err(ConfigError::Invalid("calibration travel settings must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn decompress(&self) -> Duration {
        Duration::from_millis(self.decompress_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_current_threshold")]
    pub current_threshold: f64,
    #[serde(default = "default_overcurrent_margin")]
    pub overcurrent_margin: f64,
    #[serde(default = "default_overcurrent_debounce")]
    pub overcurrent_debounce: u32,
    #[serde(default = "default_slack_power_threshold")]
    pub slack_power_threshold: f64,
    #[serde(default = "default_slack_speed_threshold")]
    pub slack_speed_threshold: f64,
    #[serde(default = "default_slack_debounce")]
    pub slack_debounce: u32,
    #[serde(default = "default_position_error_limit")]
    pub position_error_limit: f64,
    #[serde(default = "default_trip_window_ms")]
    pub trip_window_ms: u64,
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "default_encoder_window_ms")]
    pub encoder_window_ms: u64,
    #[serde(default = "default_encoder_warn_ratio")]
    pub encoder_warn_ratio: f64,
    #[serde(default = "default_encoder_panic_ratio")]
    pub encoder_panic_ratio: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            current_threshold: default_current_threshold(),
            overcurrent_margin: default_overcurrent_margin(),
            overcurrent_debounce: default_overcurrent_debounce(),
            slack_power_threshold: default_slack_power_threshold(),
            slack_speed_threshold: default_slack_speed_threshold(),
            slack_debounce: default_slack_debounce(),
            position_error_limit: default_position_error_limit(),
            trip_window_ms: default_trip_window_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            encoder_window_ms: default_encoder_window_ms(),
            encoder_warn_ratio: default_encoder_warn_ratio(),
            encoder_panic_ratio: default_encoder_panic_ratio(),
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trip_window_ms == 0 || self.encoder_window_ms == 0 || self.liveness_timeout_ms == 0 {
            return Err(ConfigError::Invalid("safety windows must be > 0".to_string()));
        }
        if self.encoder_warn_ratio > self.encoder_panic_ratio {
            return Err(ConfigError::Invalid(
                "safety.encoder_warn_ratio must not exceed encoder_panic_ratio".to_string(),
            ));
        }
        Ok(())
    }

    /// Smoothed current above which an axis counts as overloaded.
    pub fn overcurrent_limit(&self) -> f64 {
        self.current_threshold + self.overcurrent_margin
    }

    pub fn trip_window(&self) -> Duration {
        Duration::from_millis(self.trip_window_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn encoder_window(&self) -> Duration {
        Duration::from_millis(self.encoder_window_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub telemetry_log: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            listen: default_listen(),
            telemetry_log: None,
            log_level: default_log_level(),
        }
    }
}

fn default_true() -> bool { true }
fn default_frame_width() -> f64 { 3000.0 }
fn default_frame_height() -> f64 { 2000.0 }
fn default_belt_end_extension() -> f64 { 30.0 }
fn default_arm_length() -> f64 { 123.4 }
fn default_mm_per_revolution() -> f64 { 44.0 }
fn default_encoder_counts() -> u32 { 4096 }
fn default_kp() -> f64 { 300.0 }
fn default_output_limit() -> f64 { 1023.0 }
fn default_absolute_current_threshold() -> f64 { 1900.0 }
fn default_incremental_current_threshold() -> f64 { 125.0 }
fn default_baseline_alpha() -> f64 { 0.2 }
fn default_initial_baseline() -> f64 { 700.0 }
fn default_retract_speed_cap() -> u16 { 1023 }
fn default_retract_settle_speed() -> u16 { 75 }
fn default_comply_floor() -> f64 { 100.0 }
fn default_comply_growth() -> f64 { 1.75 }
fn default_comply_decay() -> f64 { 1.25 }
fn default_comply_interval_ms() -> u64 { 25 }
fn default_current_sample_ms() -> u64 { 5 }
fn default_speed_sample_ms() -> u64 { 50 }
fn default_current_buffer_len() -> usize { 10 }
fn default_grid_offset() -> f64 { 500.0 }
fn default_grid_columns() -> usize { 7 }
fn default_grid_rows() -> usize { 5 }
fn default_discard_samples() -> usize { 3 }
fn default_kept_samples() -> usize { 4 }
fn default_max_deviation() -> f64 { 2.5 }
fn default_max_failed_batches() -> u32 { 8 }
fn default_travel_speed() -> f64 { 10.0 }
fn default_arrival_tolerance() -> f64 { 0.25 }
fn default_decompress_ms() -> u64 { 750 }
fn default_settle_ms() -> u64 { 250 }
fn default_hold_ms() -> u64 { 250 }
fn default_fit_threshold() -> f64 { 2.0 }
fn default_extend_lower_offset() -> f64 { 300.0 }
fn default_current_threshold() -> f64 { 1500.0 }
fn default_overcurrent_margin() -> f64 { 2500.0 }
fn default_overcurrent_debounce() -> u32 { 10 }
fn default_slack_power_threshold() -> f64 { 750.0 }
fn default_slack_speed_threshold() -> f64 { 0.1 }
fn default_slack_debounce() -> u32 { 100 }
fn default_position_error_limit() -> f64 { 1.0 }
fn default_trip_window_ms() -> u64 { 5000 }
fn default_liveness_timeout_ms() -> u64 { 500 }
fn default_encoder_window_ms() -> u64 { 1000 }
fn default_encoder_warn_ratio() -> f64 { 0.1 }
fn default_encoder_panic_ratio() -> f64 { 0.5 }
fn default_tick_interval_ms() -> u64 { 5 }
fn default_listen() -> String { "0.0.0.0:3000".to_string() }
fn default_log_level() -> String { "info".to_string() }

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("Rejected config '{}': {}", path, e);
        return Err(e);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.frame.belt_end_extension, 30.0);
        assert_eq!(config.frame.arm_length, 123.4);
        assert_eq!(config.axis.kp, 300.0);
        assert_eq!(config.axis.ki, 0.0);
        assert_eq!(config.axis.current_buffer_len, 10);
        assert_eq!(config.calibration.max_failed_batches, 8);
        assert_eq!(config.safety.overcurrent_limit(), 4000.0);
        assert!(config.safety.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("cablebot.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "[frame]\nwidth = 2400.0\norientation = 'vertical'\n\n[safety]\nenabled = false").unwrap();
        file.flush().unwrap();
        let config = load_config(file_path.to_str().unwrap()).unwrap();
        assert_eq!(config.frame.width, 2400.0);
        assert_eq!(config.frame.orientation, Orientation::Vertical);
        assert!(!config.safety.enabled);
        // Defaults for missing fields
        assert_eq!(config.frame.height, 2000.0);
        assert_eq!(config.axis.mm_per_revolution, 44.0);
    }

    #[test]
    fn test_load_config_anchor_overrides() {
        let toml = r#"
        [frame.anchors]
        top_left = { x = -5.0, y = 2010.0 }
        top_right = { x = 3004.0, y = 1995.0, z = 40.0 }
        bottom_left = {}
        bottom_right = { x = 3000.0 }
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let anchors = config.frame.anchors.unwrap();
        assert_eq!(anchors.top_left, Point3::new(-5.0, 2010.0, 0.0));
        assert_eq!(anchors.top_right.z, 40.0);
        assert_eq!(anchors.bottom_left, Point3::default());
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("nonexistent_file.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "not a valid toml").unwrap();
        file.flush().unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_load_config_out_of_range_frame() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("tiny.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "[frame]\nwidth = 150.0").unwrap();
        file.flush().unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_grid_offset_bounds() {
        let mut calibration = CalibrationConfig::default();
        calibration.grid_offset = 50.0;
        assert!(calibration.validate().is_err());
        calibration.grid_offset = 1500.0;
        assert!(calibration.validate().is_ok());
    }
}
