//! Force-guarded motion on a single axis.
//!
//! [`MotionController`] owns the actuator and the force sensor. It issues bounded relative
//! moves, keeps the position relative to the zero reference once one exists, and implements
//! the threshold-seeking search every higher-level procedure is built from.
//!
//! Every sample read through the controller passes the overload guard, so a sensor that does
//! not check its own rating is still covered.

use crate::config::{MotionConfig, Settings, StabilityConfig};
use crate::data::sample_channel::Sample;
use crate::direction::{Direction, Still};
use crate::error::{AppResult, FdmError};
use crate::hardware::capabilities::{Actuator, ForceSensor};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a [`MotionController::move_until`] search ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOutcome {
    /// Signed distance travelled (mm)
    pub distance: f64,
    /// Last force read
    pub force: f64,
    /// Whether the predicate held for `force`
    pub reached: bool,
}

/// Force-guarded single-axis motion.
pub struct MotionController {
    actuator: Arc<dyn Actuator>,
    sensor: Arc<dyn ForceSensor>,
    /// Position relative to zero; `None` until zeroed
    position: Option<f64>,
    /// Queued but unconfirmed travel
    pending: f64,
    motion: MotionConfig,
    stability: StabilityConfig,
    max_feedrate: f64,
    max_force: f64,
}

impl MotionController {
    /// Build a controller using the motion, stability and limit settings.
    pub fn new(
        actuator: Arc<dyn Actuator>,
        sensor: Arc<dyn ForceSensor>,
        settings: &Settings,
    ) -> Self {
        Self {
            actuator,
            sensor,
            position: None,
            pending: 0.0,
            motion: settings.motion.clone(),
            stability: settings.stability.clone(),
            max_feedrate: settings.actuator.max_feedrate,
            max_force: settings.gauge.max_force,
        }
    }

    /// Motion settings in use.
    pub fn motion_config(&self) -> &MotionConfig {
        &self.motion
    }

    /// Highest feedrate a move will be issued at (mm/min).
    pub fn max_feedrate(&self) -> f64 {
        self.max_feedrate
    }

    /// The underlying actuator.
    pub fn actuator(&self) -> &Arc<dyn Actuator> {
        &self.actuator
    }

    // -------------------------------------------------------------------------
    // Position
    // -------------------------------------------------------------------------

    /// Position relative to the zero reference.
    ///
    /// # Errors
    /// `FdmError::NotZeroed` before zeroing has completed.
    pub fn position(&self) -> AppResult<f64> {
        self.position.ok_or(FdmError::NotZeroed)
    }

    /// Position if zeroed, `None` otherwise.
    pub fn try_position(&self) -> Option<f64> {
        self.position
    }

    /// Whether a zero reference exists.
    pub fn is_zeroed(&self) -> bool {
        self.position.is_some()
    }

    /// Declare the current position to be zero.
    pub fn set_zero(&mut self) {
        self.position = Some(0.0);
    }

    /// Forget the zero reference.
    pub fn clear_zero(&mut self) {
        self.position = None;
    }

    /// Signed travel issued without waiting and not yet confirmed.
    pub fn pending(&self) -> f64 {
        self.pending
    }

    /// Give up on unconfirmed travel after a failure mid-move.
    ///
    /// The axis stopped somewhere between the old position and the target, so the zero
    /// reference is dropped. Returns true if that happened.
    pub fn abandon_pending(&mut self) -> bool {
        if self.pending == 0.0 {
            return false;
        }
        warn!(
            "Abandoning {:.3} mm of unconfirmed travel, zero reference lost",
            self.pending
        );
        self.pending = 0.0;
        self.position = None;
        true
    }

    fn commit_pending(&mut self) {
        if let Some(position) = self.position.as_mut() {
            *position += self.pending;
        }
        self.pending = 0.0;
    }

    // -------------------------------------------------------------------------
    // Motion
    // -------------------------------------------------------------------------

    /// Move `distance` mm in `direction`. Returns the signed distance commanded.
    ///
    /// With `wait`, returns only after the actuator confirms the move finished; otherwise
    /// returns once the move is queued and the position is only updated by a later
    /// [`wait_settled`](Self::wait_settled). The feedrate is clamped to the configured maximum.
    ///
    /// # Errors
    /// `InvalidDirection` for `Still` with a nonzero distance.
    pub async fn move_by(
        &mut self,
        distance: f64,
        direction: Direction,
        feedrate: Option<f64>,
        wait: bool,
    ) -> AppResult<f64> {
        if distance == 0.0 {
            return Ok(0.0);
        }
        let signed = direction.signed(distance)?;
        let feedrate = feedrate.map(|f| self.clamp_feedrate(f));

        debug!(distance = signed, ?feedrate, wait, "move_by");
        self.actuator.move_rel(signed, feedrate).await?;
        self.pending += signed;
        if wait {
            self.wait_settled().await?;
        }
        Ok(signed)
    }

    /// Wait for all queued motion to finish and count it into the position.
    ///
    /// If the actuator fails to confirm, the unconfirmed travel is abandoned.
    pub async fn wait_settled(&mut self) -> AppResult<()> {
        if let Err(e) = self.actuator.wait_settled().await {
            self.abandon_pending();
            return Err(e.into());
        }
        self.commit_pending();
        Ok(())
    }

    /// Emergency stop.
    pub async fn stop(&self) -> AppResult<()> {
        self.actuator.stop().await?;
        Ok(())
    }

    /// Limit switch state (ambiguous replies are retried by the driver).
    pub async fn endstop_status(&self) -> AppResult<bool> {
        Ok(self.actuator.endstop_triggered().await?)
    }

    fn clamp_feedrate(&self, feedrate: f64) -> f64 {
        if feedrate > self.max_feedrate {
            warn!(
                "Feedrate {} exceeds maximum {}, clamping",
                feedrate, self.max_feedrate
            );
            self.max_feedrate
        } else {
            feedrate
        }
    }

    /// Step by `increment` in `direction` until `predicate(force)` holds or the travel would
    /// exceed `max_distance`.
    ///
    /// The search starts from a stabilized reading (a raw one if the gauge will not settle).
    /// Steps then use raw readings; if the last raw reading satisfied the predicate but a
    /// stabilized re-read does not, the search continues one stabilized step at a time.
    pub async fn move_until<P>(
        &mut self,
        increment: f64,
        direction: Direction,
        predicate: P,
        max_distance: f64,
    ) -> AppResult<SearchOutcome>
    where
        P: Fn(f64) -> bool + Send + Sync,
    {
        if direction == Still {
            return Err(FdmError::InvalidDirection);
        }
        let step = direction.signed(increment)?;
        if step == 0.0 {
            return Err(FdmError::Configuration(
                "move_until increment must be nonzero".to_string(),
            ));
        }

        let mut force = match self.stable_force().await {
            Ok(force) => force,
            Err(FdmError::UnstableReading { samples }) => {
                let force = self.read_force().await?;
                warn!(
                    "Force didn't stabilize after {} samples, going with {}",
                    samples, force
                );
                force
            }
            Err(e) => return Err(e),
        };

        let mut distance: f64 = 0.0;
        while !predicate(force) && distance.abs() + increment.abs() <= max_distance {
            self.move_by(increment, direction, None, true).await?;
            distance += step;
            force = self.read_force().await?;
            debug!("Moved {:.3}, force is {}", distance, force);
        }

        if predicate(force) && distance != 0.0 {
            let stable = self.stable_force().await?;
            if !predicate(stable) {
                info!(
                    "Stable force of {} failed test after {:.3}, continuing slowly",
                    stable, distance
                );
                force = stable;
                while !predicate(force) && distance.abs() + increment.abs() <= max_distance {
                    self.move_by(increment, direction, None, true).await?;
                    distance += step;
                    force = self.stable_force().await?;
                    debug!("Moved {:.3}, stable force is {}", distance, force);
                }
            } else {
                force = stable;
            }
        }

        let reached = predicate(force);
        if !reached {
            warn!(
                "Search {} stopped after {:.3} of {} without reaching target (force {})",
                direction, distance, max_distance, force
            );
        }
        Ok(SearchOutcome {
            distance,
            force,
            reached,
        })
    }

    // -------------------------------------------------------------------------
    // Sampling
    // -------------------------------------------------------------------------

    /// Next fresh sample, overload-checked.
    pub async fn read_sample(&self) -> AppResult<Sample> {
        let sample = self.sensor.next_sample().await?;
        if sample.value.abs() >= self.max_force {
            return Err(FdmError::Overload {
                force: sample.value,
                max: self.max_force,
            });
        }
        Ok(sample)
    }

    /// Next fresh force value, overload-checked.
    pub async fn read_force(&self) -> AppResult<f64> {
        Ok(self.read_sample().await?.value)
    }

    /// Mean of `n` fresh readings (at least one).
    pub async fn average_force(&self, n: usize) -> AppResult<f64> {
        let n = n.max(1);
        let mut sum = 0.0;
        for _ in 0..n {
            sum += self.read_force().await?;
        }
        Ok(sum / n as f64)
    }

    /// Stabilized reading using the configured run length and sample budget.
    pub async fn stable_force(&self) -> AppResult<f64> {
        self.stable_force_with(self.stability.n_same, self.stability.max_samples)
            .await
    }

    /// Read until the same value is seen `n_same` times in a row.
    ///
    /// # Errors
    /// `UnstableReading` once `max_samples` readings have been taken without such a run.
    pub async fn stable_force_with(&self, n_same: usize, max_samples: usize) -> AppResult<f64> {
        let n_same = n_same.max(1);
        let mut last = self.read_force().await?;
        let mut run = 1;
        let mut taken = 1;

        while run < n_same {
            if taken >= max_samples {
                return Err(FdmError::UnstableReading { samples: taken });
            }
            let value = self.read_force().await?;
            taken += 1;
            if value == last {
                run += 1;
            } else {
                last = value;
                run = 1;
            }
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction::{is_nonzero, Down, Up};
    use crate::hardware::mock::{MockActuator, ScriptedGauge};

    fn controller(
        readings: Vec<f64>,
    ) -> (MotionController, Arc<MockActuator>, Arc<ScriptedGauge>) {
        let axis = Arc::new(MockActuator::new(0.0));
        let gauge = Arc::new(ScriptedGauge::new(readings));
        let mc = MotionController::new(axis.clone(), gauge.clone(), &Settings::default());
        (mc, axis, gauge)
    }

    #[tokio::test]
    async fn stable_force_needs_a_run() {
        let (mc, _, _) = controller(vec![-0.1, -0.2, -0.2, -0.3, -0.3, -0.3]);
        assert_eq!(mc.stable_force().await.unwrap(), -0.3);
    }

    #[tokio::test]
    async fn stable_force_gives_up() {
        let readings: Vec<f64> = (0..30).map(|i| i as f64 * 0.01).collect();
        let (mc, _, gauge) = controller(readings);
        let err = mc.stable_force().await.unwrap_err();
        assert!(matches!(err, FdmError::UnstableReading { samples: 20 }));
        assert_eq!(gauge.served(), 20);
    }

    #[tokio::test]
    async fn stable_force_succeeds_on_the_last_allowed_sample() {
        let mut readings: Vec<f64> = (0..17).map(|i| i as f64 * 0.01).collect();
        readings.extend([0.5, 0.5, 0.5]);
        let (mc, _, gauge) = controller(readings);
        assert_eq!(mc.stable_force_with(3, 20).await.unwrap(), 0.5);
        assert_eq!(gauge.served(), 20);
    }

    #[tokio::test]
    async fn move_by_tracks_position_only_when_zeroed() {
        let (mut mc, axis, _) = controller(vec![0.0]);
        mc.move_by(1.0, Down, None, true).await.unwrap();
        assert!(matches!(mc.position(), Err(FdmError::NotZeroed)));

        mc.set_zero();
        mc.move_by(0.25, Down, None, true).await.unwrap();
        mc.move_by(0.5, Up, None, true).await.unwrap();
        assert_eq!(mc.position().unwrap(), 0.25);
        assert_eq!(axis.position().await, -1.0 - 0.25 + 0.5);
    }

    #[tokio::test]
    async fn unconfirmed_move_is_counted_after_wait() {
        let (mut mc, _, _) = controller(vec![0.0]);
        mc.set_zero();
        mc.move_by(2.0, Down, Some(180.0), false).await.unwrap();
        assert_eq!(mc.position().unwrap(), 0.0);
        assert_eq!(mc.pending(), -2.0);

        mc.wait_settled().await.unwrap();
        assert_eq!(mc.position().unwrap(), -2.0);
        assert_eq!(mc.pending(), 0.0);
    }

    #[tokio::test]
    async fn abandoned_move_drops_the_zero_reference() {
        let (mut mc, _, _) = controller(vec![0.0]);
        mc.set_zero();
        assert!(!mc.abandon_pending());
        assert!(mc.is_zeroed());

        mc.move_by(2.0, Down, Some(180.0), false).await.unwrap();
        assert!(mc.abandon_pending());
        assert!(matches!(mc.position(), Err(FdmError::NotZeroed)));
        assert_eq!(mc.pending(), 0.0);
    }

    #[tokio::test]
    async fn move_by_zero_is_a_no_op_and_still_is_rejected() {
        let (mut mc, axis, _) = controller(vec![0.0]);
        assert_eq!(mc.move_by(0.0, Still, None, true).await.unwrap(), 0.0);
        assert!(axis.commands().await.is_empty());
        assert!(matches!(
            mc.move_by(1.0, Still, None, true).await,
            Err(FdmError::InvalidDirection)
        ));
    }

    #[tokio::test]
    async fn feedrate_is_clamped() {
        let (mut mc, axis, _) = controller(vec![0.0]);
        mc.move_by(1.0, Up, Some(1000.0), false).await.unwrap();
        assert_eq!(
            axis.commands().await[0],
            crate::hardware::mock::MockCommand::Move {
                distance: 1.0,
                feedrate: Some(300.0)
            }
        );
    }

    #[tokio::test]
    async fn move_until_stops_at_contact() {
        // Stable zero, then three raw zeros, contact, and a stable confirmation
        let (mut mc, axis, _) = controller(vec![
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -0.05, -0.05, -0.05, -0.05,
        ]);
        let outcome = mc.move_until(0.1, Down, is_nonzero, 30.0).await.unwrap();
        assert!(outcome.reached);
        assert_eq!(outcome.force, -0.05);
        assert_eq!(axis.moves().await.len(), 4);
        assert!((outcome.distance + 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn move_until_respects_max_distance() {
        let (mut mc, axis, _) = controller(vec![0.0]);
        let outcome = mc.move_until(0.5, Down, is_nonzero, 2.0).await.unwrap();
        assert!(!outcome.reached);
        assert_eq!(axis.moves().await.len(), 4);
        assert_eq!(outcome.distance, -2.0);
    }

    #[tokio::test]
    async fn move_until_continues_slowly_when_stable_read_disagrees() {
        // Raw contact blip, stable re-read is zero, one more step to real contact
        let (mut mc, axis, _) = controller(vec![
            0.0, 0.0, 0.0, // stable start
            -0.001, // raw blip after step 1
            0.0, 0.0, 0.0, // stable re-read: zero
            -0.02, -0.02, -0.02, // stable after step 2
        ]);
        let outcome = mc.move_until(0.1, Down, is_nonzero, 30.0).await.unwrap();
        assert!(outcome.reached);
        assert_eq!(outcome.force, -0.02);
        assert_eq!(axis.moves().await.len(), 2);
    }

    #[tokio::test]
    async fn move_until_rejects_still() {
        let (mut mc, _, _) = controller(vec![0.0]);
        assert!(matches!(
            mc.move_until(0.1, Still, is_nonzero, 1.0).await,
            Err(FdmError::InvalidDirection)
        ));
    }

    #[tokio::test]
    async fn overload_guard_applies_to_every_read() {
        let (mc, _, _) = controller(vec![-3.5]);
        assert!(matches!(
            mc.read_force().await,
            Err(FdmError::Overload { force, max }) if force == -3.5 && max == 3.5
        ));
    }

    #[tokio::test]
    async fn average_force_means_n_reads() {
        let (mc, _, _) = controller(vec![-0.1, -0.2, -0.3]);
        let mean = mc.average_force(3).await.unwrap();
        assert!((mean + 0.2).abs() < 1e-12);
    }
}
