//! # fdmeter
//!
//! Force-displacement testing of bistable (snap-through) specimens with a 3D-printer Z axis and
//! a serial force gauge. The printer moves a probe into the specimen in controlled increments
//! while the gauge reports force; the tester finds the contact point, records force against
//! displacement, and detects snap-through as the force collapsing to zero or reversing.
//!
//! ## Crate Structure
//!
//! - **`config`**: `Settings` loaded from TOML and `FDMETER_` environment variables via figment.
//! - **`direction`**: `Direction` (UP/DOWN/STILL) and the force predicates searches use.
//! - **`data`**: the latest-value `SampleChannel` between gauge reader and engine, and JSON/CSV
//!   persistence of test runs.
//! - **`error`**: the `FdmError` enum and `AppResult<T>`.
//! - **`experiment`**: the `MotionController` (force-guarded moves and threshold search) and the
//!   `TestEngine` (zeroing, careful/smooth tests, loops).
//! - **`hardware`**: the `Actuator` / `ForceSensor` traits, the gauge stream decoder, the Marlin
//!   driver, serial plumbing, and simulated devices.
//! - **`logging`**: tracing-subscriber setup.
//! - **`rig`**: assembling an engine from settings, on real or simulated hardware.

pub mod config;
pub mod data;
pub mod direction;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod rig;

pub use error::{AppResult, FdmError};
