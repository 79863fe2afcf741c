//! Atomic Hardware Capabilities
//!
//! The tester needs exactly two things from hardware, so there are exactly two traits:
//!
//! - An axis implements [`Actuator`]
//! - A force gauge implements [`ForceSensor`]
//!
//! Engine code holds `Arc<dyn Actuator>` and `Arc<dyn ForceSensor>` and never knows whether it
//! is talking to a Marlin board, a serial gauge, or a simulation.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn poke<A, S>(axis: &A, gauge: &S) -> Result<f64>
//! where
//!     A: Actuator,
//!     S: ForceSensor,
//! {
//!     axis.move_rel(-0.1, None).await?;
//!     axis.wait_settled().await?;
//!     Ok(gauge.next_sample().await?.value)
//! }
//! ```

use crate::data::sample_channel::Sample;
use anyhow::Result;
use async_trait::async_trait;

/// Capability: Single-Axis Relative Motion
///
/// A linear axis driven by relative moves (a printer Z axis in relative mode).
///
/// # Contract
/// - Distances are in millimetres; positive is up, away from the specimen
/// - `move_rel` returns once the device has accepted the move, which may be before the axis
///   stops
/// - `wait_settled` blocks until every accepted move has finished
/// - The axis keeps no absolute reference; position tracking belongs to the caller
///
/// # Thread Safety
/// - All methods take `&self`
/// - Interior mutability (Mutex/RwLock) should be used for state
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Queue a relative move
    ///
    /// # Arguments
    /// * `distance` - Signed distance in mm
    /// * `feedrate` - Speed in mm/min, or `None` for the device's current feedrate
    async fn move_rel(&self, distance: f64, feedrate: Option<f64>) -> Result<()>;

    /// Wait for all queued motion to finish
    async fn wait_settled(&self) -> Result<()>;

    /// Query the lower limit switch
    ///
    /// # Returns
    /// - Ok(true) if the switch reads triggered
    /// - Ok(false) if it reads open
    /// - Err if no unambiguous answer could be obtained
    async fn endstop_triggered(&self) -> Result<bool>;

    /// Stop motion immediately, discarding queued moves
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Streaming Force Measurement
///
/// Devices that push force readings continuously; the consumer only ever wants the newest one.
///
/// # Contract
/// - `next_sample()` waits for a reading newer than the last one it returned
/// - Readings that arrived in between are skipped, not queued
/// - Units are gauge units, negative while pushing
#[async_trait]
pub trait ForceSensor: Send + Sync {
    /// Wait for the next fresh sample
    ///
    /// # Returns
    /// - Ok(sample) with the latest reading
    /// - Err on overload, lost link or timeout
    async fn next_sample(&self) -> Result<Sample>;
}
