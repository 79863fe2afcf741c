//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/fdmeter.toml` (optional; every field has a default)
//! 2. Environment variables prefixed with `FDMETER_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use fdmeter::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Gauge overload at {}", settings.gauge.max_force);
//! # Ok::<(), fdmeter::error::FdmError>(())
//! ```
//!
//! `FDMETER_ACTUATOR__PORT=/dev/ttyACM0` overrides `actuator.port`.

use crate::error::{AppResult, FdmError};
use crate::hardware::force_gauge::{WidthStrategy, KNOWN_RECORD_WIDTHS};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/fdmeter.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Force gauge link and decoding
    pub gauge: GaugeConfig,
    /// Printer board link
    pub actuator: ActuatorConfig,
    /// Search increments and travel limits
    pub motion: MotionConfig,
    /// Stabilized sampling
    pub stability: StabilityConfig,
    /// Result files
    pub storage: StorageConfig,
    /// Tracing output
    pub logging: LoggingConfig,
}

/// Force gauge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0")
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate
    #[serde(default = "default_gauge_baud")]
    pub baud_rate: u32,
    /// Rated maximum; any |reading| at or above it aborts the run
    #[serde(default = "default_max_force")]
    pub max_force: f64,
    /// How the record width is determined
    #[serde(default)]
    pub width: WidthStrategy,
    /// Fail if no sample arrives within this many milliseconds (unset = wait forever)
    #[serde(default)]
    pub sample_timeout_ms: Option<u64>,
}

/// Marlin actuator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Serial port path (e.g. "/dev/ttyACM0")
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate
    #[serde(default = "default_actuator_baud")]
    pub baud_rate: u32,
    /// Feedrate set at startup (mm/min)
    #[serde(default = "default_feedrate")]
    pub default_feedrate: f64,
    /// Requested feedrates are clamped to this (mm/min)
    #[serde(default = "default_max_feedrate")]
    pub max_feedrate: f64,
    /// How long to wait for a command's `ok`
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    /// Extra endstop queries after an ambiguous answer
    #[serde(default = "default_endstop_retries")]
    pub endstop_retries: u32,
}

/// Motion configuration (all distances in mm)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Step used for the coarse zeroing approach
    #[serde(default = "default_coarse_increment")]
    pub coarse_increment: f64,
    /// Step used for the fine zeroing approach and contact searches
    #[serde(default = "default_fine_increment")]
    pub fine_increment: f64,
    /// Smallest step the force-null search will take
    #[serde(default = "default_min_step")]
    pub min_step: f64,
    /// Travel budget for a single force-null search
    #[serde(default = "default_max_zero_search")]
    pub max_zero_search: f64,
    /// Travel budget for a contact search
    #[serde(default = "default_max_approach_distance")]
    pub max_approach_distance: f64,
    /// Feedrate used to retract after a test (mm/min)
    #[serde(default = "default_feedrate")]
    pub return_feedrate: f64,
}

/// Stabilized sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Identical consecutive readings required
    #[serde(default = "default_n_same")]
    pub n_same: usize,
    /// Readings taken before giving up
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

/// Output file format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    /// `{"test_params": ..., "test_results": [...]}`
    #[default]
    Json,
    /// Commented parameter block, then one row per result
    Csv,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for result files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Output format
    #[serde(default)]
    pub format: StorageFormat,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
}

// Default value functions
fn default_gauge_baud() -> u32 {
    2400
}

fn default_max_force() -> f64 {
    3.5
}

fn default_actuator_baud() -> u32 {
    115_200
}

fn default_feedrate() -> f64 {
    180.0
}

fn default_max_feedrate() -> f64 {
    300.0
}

fn default_ack_timeout() -> u64 {
    120
}

fn default_endstop_retries() -> u32 {
    10
}

fn default_coarse_increment() -> f64 {
    0.5
}

fn default_fine_increment() -> f64 {
    0.1
}

fn default_min_step() -> f64 {
    0.1
}

fn default_max_zero_search() -> f64 {
    5.0
}

fn default_max_approach_distance() -> f64 {
    30.0
}

fn default_n_same() -> usize {
    3
}

fn default_max_samples() -> usize {
    20
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GaugeConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_gauge_baud(),
            max_force: default_max_force(),
            width: WidthStrategy::default(),
            sample_timeout_ms: None,
        }
    }
}

impl GaugeConfig {
    /// Sample timeout as a `Duration`, if configured.
    pub fn sample_timeout(&self) -> Option<Duration> {
        self.sample_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_actuator_baud(),
            default_feedrate: default_feedrate(),
            max_feedrate: default_max_feedrate(),
            ack_timeout_secs: default_ack_timeout(),
            endstop_retries: default_endstop_retries(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            coarse_increment: default_coarse_increment(),
            fine_increment: default_fine_increment(),
            min_step: default_min_step(),
            max_zero_search: default_max_zero_search(),
            max_approach_distance: default_max_approach_distance(),
            return_feedrate: default_feedrate(),
        }
    }
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            n_same: default_n_same(),
            max_samples: default_max_samples(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            format: StorageFormat::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
        }
    }
}

impl Settings {
    /// Load configuration from `config/fdmeter.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, then validate it.
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The provider stack, exposed so callers can merge CLI overrides on top.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FDMETER_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(FdmError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.gauge.max_force <= 0.0 {
            return Err(FdmError::Configuration(format!(
                "gauge.max_force must be positive, got {}",
                self.gauge.max_force
            )));
        }

        if let WidthStrategy::Fixed(width) = self.gauge.width {
            if !KNOWN_RECORD_WIDTHS.contains(&width) {
                return Err(FdmError::Configuration(format!(
                    "gauge.width fixed = {} is not a known record width {:?}",
                    width, KNOWN_RECORD_WIDTHS
                )));
            }
        }

        let positive = [
            ("motion.coarse_increment", self.motion.coarse_increment),
            ("motion.fine_increment", self.motion.fine_increment),
            ("motion.min_step", self.motion.min_step),
            ("motion.max_zero_search", self.motion.max_zero_search),
            ("motion.max_approach_distance", self.motion.max_approach_distance),
            ("motion.return_feedrate", self.motion.return_feedrate),
            ("actuator.default_feedrate", self.actuator.default_feedrate),
            ("actuator.max_feedrate", self.actuator.max_feedrate),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(FdmError::Configuration(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        if self.stability.n_same == 0 || self.stability.n_same > self.stability.max_samples {
            return Err(FdmError::Configuration(format!(
                "stability.n_same must be between 1 and max_samples ({}), got {}",
                self.stability.max_samples, self.stability.n_same
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
    fn defaults_match_the_rig() {
        let settings = Settings::default();
        assert_eq!(settings.gauge.baud_rate, 2400);
        assert_eq!(settings.gauge.max_force, 3.5);
        assert_eq!(settings.gauge.width, WidthStrategy::Measured);
        assert_eq!(settings.actuator.default_feedrate, 180.0);
        assert_eq!(settings.actuator.max_feedrate, 300.0);
        assert_eq!(settings.motion.coarse_increment, 0.5);
        assert_eq!(settings.motion.fine_increment, 0.1);
        assert_eq!(settings.stability.n_same, 3);
        assert_eq!(settings.stability.max_samples, 20);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[gauge]
port = "/dev/ttyUSB1"
width = {{ fixed = 7 }}

[motion]
fine_increment = 0.05

[storage]
format = "csv"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.gauge.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(settings.gauge.width, WidthStrategy::Fixed(7));
        assert_eq!(settings.motion.fine_increment, 0.05);
        assert_eq!(settings.motion.coarse_increment, 0.5);
        assert_eq!(settings.storage.format, StorageFormat::Csv);
    }

    #[test]
    fn environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("fdmeter.toml", "[actuator]\nport = \"/dev/ttyACM0\"\n")?;
            jail.set_env("FDMETER_ACTUATOR__PORT", "/dev/ttyACM1");
            jail.set_env("FDMETER_STABILITY__N_SAME", "4");

            let settings = Settings::load_from("fdmeter.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.actuator.port.as_deref(), Some("/dev/ttyACM1"));
            assert_eq!(settings.stability.n_same, 4);
            Ok(())
        });
    }

    #[test]
    fn missing_file_uses_defaults() {
        let settings = Settings::load_from("/nonexistent/fdmeter.toml").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.gauge.width = WidthStrategy::Fixed(5);
        assert!(matches!(settings.validate(), Err(FdmError::Configuration(_))));

        let mut settings = Settings::default();
        settings.stability.n_same = 25;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.motion.fine_increment = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.level = "verbose".to_string();
        assert!(settings.validate().is_err());
    }
}
