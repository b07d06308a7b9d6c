// src/config.rs - configuration entry points for the binaries

pub use cablebot_shared::config::*;
use std::path::Path;

/// Loads `path`, or the built-in machine when the file does not exist.
pub fn load_or_default(path: &str) -> Result<Config, ConfigError> {
    if !Path::new(path).exists() {
        tracing::warn!("Config file '{}' not found, using built-in defaults", path);
        return Ok(Config::default());
    }
    load_config(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_or_default("/nonexistent/cablebot.toml").unwrap();
        assert_eq!(config.frame.width, 3000.0);
    }

    #[test]
    fn present_file_is_still_validated() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[frame]\nwidth = 50.0").unwrap();
        let result = load_or_default(file.path().to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
