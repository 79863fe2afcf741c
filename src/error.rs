//! Custom error types for the application.
//!
//! `FdmError` is the single error type returned by the motion engine, the sample channel and the
//! storage layer. Hardware drivers and capability traits keep using `anyhow::Result`; converting
//! an `anyhow::Error` into `FdmError` recovers a typed `FdmError` if one is carried inside it, so
//! an overload raised deep inside a sensor implementation still arrives as `FdmError::Overload`.
//!
//! ## Error Categories
//!
//! 1. **Fatal run errors** - `Overload`, `UnstableReading`, `ZeroingFailed`, `LinkLost`,
//!    `DeviceUnresponsive`. Callers must stop all motion (see [`FdmError::requires_stop`]).
//! 2. **Usage errors** - `NotZeroed`, `InvalidDirection`, `Configuration`.
//! 3. **I/O and format errors** - `Io`, `Json`, `Csv`, `Figment`, `Hardware`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, FdmError>;

/// Primary error type for force-displacement testing.
#[derive(Error, Debug)]
pub enum FdmError {
    /// The measured force reached the gauge's rated maximum.
    #[error("Force of {force} exceeded max force threshold {max}")]
    Overload {
        /// Offending reading
        force: f64,
        /// Configured threshold
        max: f64,
    },

    /// Stabilization never saw enough identical consecutive readings.
    #[error("Readings never stabilized after {samples} samples")]
    UnstableReading {
        /// Number of samples taken before giving up
        samples: usize,
    },

    /// Contact or force-null expected during zeroing (or a test pre-move) was not observed.
    #[error("Zeroing failed: {0}")]
    ZeroingFailed(String),

    /// Position was queried before a zero reference was established.
    #[error("Axis is not zeroed")]
    NotZeroed,

    /// `Direction::Still` was passed to a magnitude-bearing motion.
    #[error("Direction STILL cannot be used for motion")]
    InvalidDirection,

    /// The gauge link dropped or its reader task went away.
    #[error("Force gauge link lost: {0}")]
    LinkLost(String),

    /// No new sample arrived within the configured timeout.
    #[error("Force gauge unresponsive: no sample within {0:?}")]
    DeviceUnresponsive(Duration),

    /// Semantically invalid configuration or test parameters.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Figment(#[from] figment::Error),

    /// File or serial I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV (de)serialization failure.
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Any other error raised by a hardware driver.
    #[error("Hardware error: {0:#}")]
    Hardware(anyhow::Error),
}

impl FdmError {
    /// True for errors after which all motion must stop immediately.
    pub fn requires_stop(&self) -> bool {
        matches!(
            self,
            FdmError::Overload { .. }
                | FdmError::UnstableReading { .. }
                | FdmError::ZeroingFailed(_)
                | FdmError::LinkLost(_)
                | FdmError::DeviceUnresponsive(_)
                | FdmError::Hardware(_)
        )
    }
}

impl From<anyhow::Error> for FdmError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<FdmError>() {
            Ok(inner) => inner,
            Err(err) => FdmError::Hardware(err),
        }
    }
}
