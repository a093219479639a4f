//! # Bridge Configuration
//!
//! One TOML file describes the serial link, printer-side paths and limits,
//! and any user macros.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200          # omit to try the common rates in turn
//! max_connection_attempts = 5
//!
//! [printer]
//! gcode_dir = "/home/pi/gcodes"
//! report_velocity = true
//!
//! [printer.extruder]
//! max_temp = 275.0
//!
//! [macros.START_PRINT]
//! description = "Heat and home"
//! gcode = """
//! M140 S{params.bed|default(60)}
//! M104 S{params.extruder|default(200)}
//! G28
//! """
//!
//! [macros.PAUSE]
//! rename_existing = "BASE_PAUSE"
//! gcode = "BASE_PAUSE\nG91\nG1 Z10\nG90"
//!
//! [macros.PARK.variables]
//! x = 10.0
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub serial: SerialConfig,
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub macros: BTreeMap<String, MacroConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    pub port: String,
    /// Fixed rate; when absent each attempt tries the next common rate.
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default = "default_max_connection_attempts")]
    pub max_connection_attempts: u32,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: None,
            max_connection_attempts: default_max_connection_attempts(),
            connection_timeout_ms: default_connection_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl SerialConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default = "default_gcode_dir")]
    pub gcode_dir: PathBuf,
    /// Poll position faster so `motion_report` velocities are meaningful.
    #[serde(default)]
    pub report_velocity: bool,
    #[serde(default = "default_extruder_limits")]
    pub extruder: HeaterLimits,
    #[serde(default = "default_bed_limits")]
    pub heater_bed: HeaterLimits,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            gcode_dir: default_gcode_dir(),
            report_velocity: false,
            extruder: default_extruder_limits(),
            heater_bed: default_bed_limits(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct HeaterLimits {
    #[serde(default)]
    pub min_temp: f64,
    pub max_temp: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MacroConfig {
    pub gcode: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rename_existing: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_max_connection_attempts() -> u32 {
    5
}
fn default_connection_timeout_ms() -> u64 {
    5000
}
fn default_reconnect_delay_ms() -> u64 {
    5000
}
fn default_gcode_dir() -> PathBuf {
    PathBuf::from("gcodes")
}
fn default_extruder_limits() -> HeaterLimits {
    HeaterLimits { min_temp: 0.0, max_temp: 250.0 }
}
fn default_bed_limits() -> HeaterLimits {
    HeaterLimits { min_temp: 0.0, max_temp: 120.0 }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.trim().is_empty() {
            return Err(ConfigError::Invalid("serial.port must not be empty".into()));
        }
        if self.serial.max_connection_attempts == 0 {
            return Err(ConfigError::Invalid("serial.max_connection_attempts must be at least 1".into()));
        }
        if self.serial.connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid("serial.connection_timeout_ms must be positive".into()));
        }
        if self.serial.baud_rate == Some(0) {
            return Err(ConfigError::Invalid("serial.baud_rate must be positive".into()));
        }
        for (name, limits) in [("extruder", &self.printer.extruder), ("heater_bed", &self.printer.heater_bed)] {
            if limits.min_temp > limits.max_temp {
                return Err(ConfigError::Invalid(format!("printer.{name}: min_temp exceeds max_temp")));
            }
        }
        for (name, macro_config) in &self.macros {
            if name.trim().is_empty() || name.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!("invalid macro name '{name}'")));
            }
            if macro_config.gcode.trim().is_empty() {
                tracing::warn!("Macro {} has an empty gcode body", name);
            }
        }
        Ok(())
    }
}

/// Reads, parses and validates a config file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path.display(), e);
            return Err(ConfigError::Io(e));
        }
    };
    let config: Config = match toml::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to parse config TOML: {}", e);
            return Err(ConfigError::Toml(e));
        }
    };
    config.validate()?;
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
        assert_eq!(config.serial.baud_rate, None);
        assert_eq!(config.serial.max_connection_attempts, 5);
        assert_eq!(config.serial.connection_timeout(), Duration::from_secs(5));
        assert_eq!(config.printer.extruder.max_temp, 250.0);
        assert!(config.macros.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("printer.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            "[serial]\nport = '/dev/ttyACM0'\nbaud_rate = 115200\n\n[printer.heater_bed]\nmax_temp = 110.0\n\n[macros.park]\ngcode = 'G1 X{{x}}'\nrename_existing = 'PARK_OLD'\n\n[macros.park.variables]\nx = 12.5"
        )
        .unwrap();
        file.flush().unwrap();
        let config = load_config(&file_path).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, Some(115200));
        assert_eq!(config.printer.heater_bed.max_temp, 110.0);
        // Defaults for missing fields
        assert_eq!(config.serial.reconnect_delay_ms, 5000);
        let park = &config.macros["park"];
        assert_eq!(park.gcode, "G1 X{x}");
        assert_eq!(park.rename_existing.as_deref(), Some("PARK_OLD"));
        assert_eq!(park.variables["x"], Value::from(12.5));
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
        let result = load_config(&file_path);
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.serial.max_connection_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.printer.extruder = HeaterLimits { min_temp: 300.0, max_temp: 250.0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_equal_heater_limits_are_accepted() {
        let mut config = Config::default();
        config.printer.heater_bed = HeaterLimits { min_temp: 60.0, max_temp: 60.0 };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serial_port_is_required() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("printer.toml");
        std::fs::write(&file_path, "[printer]\ngcode_dir = 'gcodes'\n").unwrap();
        assert!(matches!(load_config(&file_path), Err(ConfigError::Toml(_))));

        std::fs::write(&file_path, "[serial]\nbaud_rate = 250000\n").unwrap();
        let err = load_config(&file_path).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
        assert!(err.to_string().contains("port"));
    }
}
