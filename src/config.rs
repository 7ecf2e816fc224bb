//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (default `config/stage.toml`)
//! 2. Environment variables prefixed with `STAGE_TRIGGER_`, nested with `__`
//!
//! Every section has defaults, so a missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use stage_trigger::config::StageConfig;
//!
//! let config = StageConfig::load()?;
//! config.validate()?;
//! println!("Threshold: {} V", config.control.voltage_threshold);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{AppResult, ControlError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lowest speed accepted for automatic or manual motion (mm/s).
pub const MIN_SPEED_MM_S: f64 = 0.1;
/// Highest speed accepted for automatic or manual motion (mm/s).
pub const MAX_SPEED_MM_S: f64 = 700.0;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/stage.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Sensor microcontroller link
    #[serde(default)]
    pub sensor: SensorConfig,
    /// Threshold policy and loop cadence
    #[serde(default)]
    pub control: ControlConfig,
    /// Motion controller link and axis conversion
    #[serde(default)]
    pub axis: AxisConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Stage Trigger".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Sensor serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Baud rate of the microcontroller link
    #[serde(default = "default_sensor_baud")]
    pub baud_rate: u32,
    /// Longest time a single line read may wait before reporting "no data"
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_sensor_baud(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl SensorConfig {
    /// Read timeout as a `Duration`.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Automatic control policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Voltage below which the axis is driven to its minimum limit
    #[serde(default = "default_threshold")]
    pub voltage_threshold: f64,
    /// Pause between loop iterations when no sensor line was ready
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Speed used by hosts that do not supply one
    #[serde(default = "default_speed")]
    pub default_speed_mm_s: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            voltage_threshold: default_threshold(),
            poll_interval_ms: default_poll_interval(),
            default_speed_mm_s: default_speed(),
        }
    }
}

impl ControlConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Motion controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Baud rate of the motion controller link (Zaber ASCII default: 115200)
    #[serde(default = "default_axis_baud")]
    pub baud_rate: u32,
    /// Axis number on the detected device (1-based)
    #[serde(default = "default_axis_number")]
    pub axis_number: u8,
    /// Timeout for a single command/reply exchange
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// How long device detection listens for replies
    #[serde(default = "default_detect_window")]
    pub detect_window_ms: u64,
    /// Interval between `is_busy` polls while waiting for a move
    #[serde(default = "default_busy_poll")]
    pub busy_poll_interval_ms: u64,
    /// Upper bound on waiting for a single move to complete
    #[serde(default = "default_max_move_wait")]
    pub max_move_wait_secs: u64,
    /// Linear distance of one microstep, in micrometres
    #[serde(default = "default_microstep_size")]
    pub microstep_size_um: f64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_axis_baud(),
            axis_number: default_axis_number(),
            command_timeout_ms: default_command_timeout(),
            detect_window_ms: default_detect_window(),
            busy_poll_interval_ms: default_busy_poll(),
            max_move_wait_secs: default_max_move_wait(),
            microstep_size_um: default_microstep_size(),
        }
    }
}

impl AxisConfig {
    /// Command timeout as a `Duration`.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Detection window as a `Duration`.
    pub fn detect_window(&self) -> Duration {
        Duration::from_millis(self.detect_window_ms)
    }

    /// Busy-poll interval as a `Duration`.
    pub fn busy_poll_interval(&self) -> Duration {
        Duration::from_millis(self.busy_poll_interval_ms)
    }

    /// Maximum move wait as a `Duration`.
    pub fn max_move_wait(&self) -> Duration {
        Duration::from_secs(self.max_move_wait_secs)
    }
}

// Default value functions
fn default_sensor_baud() -> u32 {
    9600
}

fn default_read_timeout() -> u64 {
    100
}

fn default_threshold() -> f64 {
    4.0
}

fn default_poll_interval() -> u64 {
    10
}

fn default_speed() -> f64 {
    10.0
}

fn default_axis_baud() -> u32 {
    115_200
}

fn default_axis_number() -> u8 {
    1
}

fn default_command_timeout() -> u64 {
    2000
}

fn default_detect_window() -> u64 {
    300
}

fn default_busy_poll() -> u64 {
    100
}

fn default_max_move_wait() -> u64 {
    120
}

fn default_microstep_size() -> f64 {
    0.047625
}

/// Check that a speed lies in `[MIN_SPEED_MM_S, MAX_SPEED_MM_S]`.
pub fn validate_speed(speed_mm_s: f64) -> AppResult<f64> {
    if speed_mm_s.is_finite() && (MIN_SPEED_MM_S..=MAX_SPEED_MM_S).contains(&speed_mm_s) {
        Ok(speed_mm_s)
    } else {
        Err(ControlError::InvalidSpeed(speed_mm_s))
    }
}

impl StageConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Environment variables override file values with prefix `STAGE_TRIGGER_`.
    /// Example: `STAGE_TRIGGER_CONTROL__VOLTAGE_THRESHOLD=3.5`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(StageConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STAGE_TRIGGER_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ControlError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(self.control.voltage_threshold.is_finite() && self.control.voltage_threshold > 0.0) {
            return Err(ControlError::Configuration(format!(
                "voltage_threshold must be a positive number, got {}",
                self.control.voltage_threshold
            )));
        }

        validate_speed(self.control.default_speed_mm_s).map_err(|_| {
            ControlError::Configuration(format!(
                "default_speed_mm_s {} is outside [{}, {}]",
                self.control.default_speed_mm_s, MIN_SPEED_MM_S, MAX_SPEED_MM_S
            ))
        })?;

        if self.sensor.baud_rate == 0 || self.axis.baud_rate == 0 {
            return Err(ControlError::Configuration(
                "baud_rate must be non-zero".to_string(),
            ));
        }

        if self.sensor.read_timeout_ms == 0 {
            return Err(ControlError::Configuration(
                "sensor.read_timeout_ms must be non-zero".to_string(),
            ));
        }

        if self.axis.axis_number == 0 {
            return Err(ControlError::Configuration(
                "axis_number is 1-based; 0 is not a valid axis".to_string(),
            ));
        }

        if self.axis.command_timeout_ms == 0
            || self.axis.busy_poll_interval_ms == 0
            || self.axis.max_move_wait_secs == 0
        {
            return Err(ControlError::Configuration(
                "axis timeouts and poll interval must be non-zero".to_string(),
            ));
        }

        if !(self.axis.microstep_size_um.is_finite() && self.axis.microstep_size_um > 0.0) {
            return Err(ControlError::Configuration(format!(
                "microstep_size_um must be positive, got {}",
                self.axis.microstep_size_um
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = StageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sensor.baud_rate, 9600);
        assert_eq!(config.control.voltage_threshold, 4.0);
        assert_eq!(config.axis.busy_poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_load_from_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [control]
            voltage_threshold = 3.5

            [axis]
            axis_number = 2
            "#
        )
        .unwrap();

        let config = StageConfig::load_from(file.path()).unwrap();
        assert_eq!(config.control.voltage_threshold, 3.5);
        assert_eq!(config.axis.axis_number, 2);
        // Untouched sections keep their defaults
        assert_eq!(config.sensor.baud_rate, 9600);
        assert_eq!(config.application.log_level, "info");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = StageConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.control.default_speed_mm_s, 10.0);
    }

    #[test]
    fn test_config_validation() {
        let mut config = StageConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = StageConfig::default();
        config.axis.axis_number = 0;
        assert!(config.validate().is_err());

        let mut config = StageConfig::default();
        config.control.default_speed_mm_s = 701.0;
        assert!(matches!(
            config.validate(),
            Err(ControlError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_speed_bounds() {
        assert!(validate_speed(0.1).is_ok());
        assert!(validate_speed(700.0).is_ok());
        assert!(validate_speed(0.09).is_err());
        assert!(validate_speed(700.1).is_err());
        assert!(validate_speed(f64::NAN).is_err());
    }
}
