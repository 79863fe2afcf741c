//! Axis zeroing and force-null search.
//!
//! The printer has no usable absolute reference at the specimen, so zero is defined by touch:
//! the first nonzero reading of a fine approach toward the specimen.
//!
//! # State Machine
//!
//! ```text
//! UnZeroed ──> ApproachingCoarse ──> BackoffCoarse ──> ApproachingFine ──┬──> Zeroed
//!                                                                        │       ▲
//!                                                                        └─> BackoffFine
//! ```

use crate::direction::{is_nonzero, zero_or_toward, Direction, Still};
use crate::error::{AppResult, FdmError};
use crate::experiment::engine::TestEngine;
use crate::experiment::motion::SearchOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Progress of [`TestEngine::zero_axis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZeroingState {
    /// No zero reference
    UnZeroed,
    /// Stepping toward the specimen in coarse increments
    ApproachingCoarse,
    /// Backing off until the force nulls
    BackoffCoarse,
    /// Stepping toward the specimen in fine increments
    ApproachingFine,
    /// Backing off from the zero point
    BackoffFine,
    /// Position is valid
    Zeroed,
}

impl fmt::Display for ZeroingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ZeroingState::UnZeroed => "UnZeroed",
            ZeroingState::ApproachingCoarse => "ApproachingCoarse",
            ZeroingState::BackoffCoarse => "BackoffCoarse",
            ZeroingState::ApproachingFine => "ApproachingFine",
            ZeroingState::BackoffFine => "BackoffFine",
            ZeroingState::Zeroed => "Zeroed",
        };
        write!(f, "{}", label)
    }
}

impl TestEngine {
    fn transition(&mut self, next: ZeroingState) {
        info!("Zeroing: {} -> {}", self.zeroing, next);
        self.zeroing = next;
    }

    /// Establish the zero reference by touching the specimen moving in `direction`.
    ///
    /// Nulls any residual force, approaches coarsely, backs off, then approaches finely; the
    /// first nonzero reading of the fine approach becomes position 0. With `backoff`, the probe
    /// then retreats until the force nulls again (position is tracked from there).
    ///
    /// # Errors
    /// - `InvalidDirection` for `Still`
    /// - `ZeroingFailed` if a residual force cannot be nulled or no contact is found
    pub async fn zero_axis(&mut self, direction: Direction, backoff: bool) -> AppResult<()> {
        if direction == Still {
            return Err(FdmError::InvalidDirection);
        }

        self.motion.clear_zero();
        self.zeroing = ZeroingState::UnZeroed;
        info!("Zeroing Z axis moving {}", direction);

        let result = self.zero_axis_steps(direction, backoff).await;
        if result.is_err() {
            self.motion.clear_zero();
            self.zeroing = ZeroingState::UnZeroed;
        }
        result
    }

    async fn zero_axis_steps(&mut self, direction: Direction, backoff: bool) -> AppResult<()> {
        let coarse = self.motion.motion_config().coarse_increment;
        let fine = self.motion.motion_config().fine_increment;
        let max_approach = self.motion.motion_config().max_approach_distance;

        self.move_to_zero(None).await?;
        let force = self.motion.read_force().await?;
        if force != 0.0 {
            let stable = self.motion.stable_force().await?;
            if stable != 0.0 {
                return Err(FdmError::ZeroingFailed(format!(
                    "force of {} still nonzero after nulling",
                    stable
                )));
            }
        }

        self.transition(ZeroingState::ApproachingCoarse);
        let outcome = self
            .motion
            .move_until(coarse, direction, is_nonzero, max_approach)
            .await?;
        self.ensure_contact("coarse", direction, outcome).await?;

        self.transition(ZeroingState::BackoffCoarse);
        self.move_to_zero(Some(coarse)).await?;

        self.transition(ZeroingState::ApproachingFine);
        let outcome = self
            .motion
            .move_until(fine, direction, is_nonzero, max_approach)
            .await?;
        self.ensure_contact("fine", direction, outcome).await?;
        self.motion.set_zero();

        if backoff {
            self.transition(ZeroingState::BackoffFine);
            self.move_to_zero(Some(fine)).await?;
        }
        self.transition(ZeroingState::Zeroed);

        info!(
            "Zeroed Z axis, backed off to {:.3}, force = {}",
            self.motion.try_position().unwrap_or_default(),
            self.motion.read_force().await?
        );
        Ok(())
    }

    /// Fail with `ZeroingFailed` unless the approach ended in contact.
    async fn ensure_contact(
        &self,
        stage: &str,
        direction: Direction,
        outcome: SearchOutcome,
    ) -> AppResult<()> {
        if outcome.reached {
            return Ok(());
        }
        if self.motion.read_force().await? != 0.0 || self.motion.stable_force().await? != 0.0 {
            return Ok(());
        }
        let endstop = match self.motion.endstop_status().await {
            Ok(true) => "triggered",
            Ok(false) => "open",
            Err(_) => "unknown",
        };
        Err(FdmError::ZeroingFailed(format!(
            "{} approach moved {:.3} mm {} without contact (endstop {})",
            stage, outcome.distance, direction, endstop
        )))
    }

    /// Move against the force until it reads zero. Returns the signed distance moved.
    ///
    /// The step starts at twice `step` (default: the fine increment) and halves each time the
    /// force crosses over, never going below the minimum step. Total travel is bounded by the
    /// force-null search budget. Zero force on entry means no motion.
    pub async fn move_to_zero(&mut self, step: Option<f64>) -> AppResult<f64> {
        let config = self.motion.motion_config().clone();
        let mut step = 2.0 * step.unwrap_or(config.fine_increment);
        let mut moved = 0.0;
        let mut travelled = 0.0;

        loop {
            let force = self.motion.read_force().await?;
            if force == 0.0 {
                break;
            }

            let remaining = config.max_zero_search - travelled;
            step = (step / 2.0).max(config.min_step);
            if remaining < step {
                warn!(
                    "Force-null search used its {} mm budget, force still {}",
                    config.max_zero_search, force
                );
                break;
            }

            let direction = Direction::from_force(force).flip();
            debug!(
                "Move to zero: force is {}, moving by {} {} until 0",
                force, step, direction
            );
            let outcome = self
                .motion
                .move_until(step, direction, zero_or_toward(direction), remaining)
                .await?;
            if outcome.distance == 0.0 {
                break;
            }
            moved += outcome.distance;
            travelled += outcome.distance.abs();
        }

        info!("Moved by {:.3} to get zero force", moved);
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::direction::{Down, Up};
    use crate::hardware::capabilities::Actuator;
    use crate::hardware::mock::{MockActuator, ScriptedGauge, SimulatedGauge, SpecimenModel};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn simulated(surface: f64) -> (TestEngine, Arc<MockActuator>) {
        let axis = Arc::new(MockActuator::new(0.0).with_endstop(-40.0));
        let gauge = SimulatedGauge::new(axis.clone(), SpecimenModel::new(surface, 1.0, 3.0, 3.0))
            .with_period(Duration::ZERO);
        let engine = TestEngine::new(axis.clone(), Arc::new(gauge), &Settings::default());
        (engine, axis)
    }

    #[tokio::test]
    async fn move_to_zero_at_zero_force_does_nothing() {
        let axis = Arc::new(MockActuator::new(0.0));
        let gauge = Arc::new(ScriptedGauge::new([0.0]));
        let mut engine = TestEngine::new(axis.clone(), gauge, &Settings::default());

        assert_eq!(engine.move_to_zero(None).await.unwrap(), 0.0);
        assert!(axis.moves().await.is_empty());
    }

    #[tokio::test]
    async fn move_to_zero_backs_off_a_pushing_probe() {
        let (mut engine, axis) = simulated(0.0);
        axis.move_rel(-0.55, None).await.unwrap();

        let moved = engine.move_to_zero(None).await.unwrap();
        assert!(moved > 0.0);
        assert!(axis.position().await >= 0.0);
        assert_eq!(engine.motion().read_force().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn zero_axis_defines_position_at_first_contact() {
        let (mut engine, axis) = simulated(-2.03);
        assert!(matches!(engine.motion().position(), Err(FdmError::NotZeroed)));

        engine.zero_axis(Down, false).await.unwrap();
        assert_eq!(engine.zeroing_state(), ZeroingState::Zeroed);
        assert_eq!(engine.motion().position().unwrap(), 0.0);

        // Zero is the first fine step past the surface
        let here = axis.position().await;
        assert!(here < -2.03 && here > -2.03 - 0.1 - 1e-9, "zeroed at {}", here);
        assert!(engine.motion().read_force().await.unwrap() < 0.0);
    }

    #[tokio::test]
    #[traced_test]
    async fn zero_axis_logs_each_transition() {
        let (mut engine, _axis) = simulated(-1.0);
        engine.zero_axis(Down, true).await.unwrap();
        assert!(logs_contain("UnZeroed -> ApproachingCoarse"));
        assert!(logs_contain("ApproachingFine -> BackoffFine"));
        assert!(logs_contain("BackoffFine -> Zeroed"));
    }

    #[tokio::test]
    async fn zero_axis_with_backoff_ends_at_null_force() {
        let (mut engine, _axis) = simulated(-1.0);
        engine.zero_axis(Down, true).await.unwrap();
        assert!(engine.motion().position().unwrap() > 0.0);
        assert_eq!(engine.motion().read_force().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn zero_axis_without_contact_fails() {
        // Specimen far below the approach budget
        let (mut engine, _axis) = simulated(-100.0);
        let err = engine.zero_axis(Down, true).await.unwrap_err();
        match err {
            FdmError::ZeroingFailed(msg) => assert!(msg.contains("endstop"), "{}", msg),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(engine.zeroing_state(), ZeroingState::UnZeroed);
        assert!(!engine.motion().is_zeroed());
    }

    #[tokio::test]
    async fn zero_axis_rejects_still() {
        let (mut engine, _axis) = simulated(-1.0);
        assert!(matches!(
            engine.zero_axis(Still, true).await,
            Err(FdmError::InvalidDirection)
        ));
        assert!(matches!(
            engine.zero_axis(Up, true).await,
            Err(FdmError::ZeroingFailed(_))
        ));
    }
}
