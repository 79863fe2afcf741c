//! Test protocols.
//!
//! - **Careful**: step, average, record, repeat until snap-through (force zero or reversed)
//! - **Smooth**: one continuous move at a set feedrate, recording every sample on the way
//! - **Loop**: alternate directions for a number of repetitions using either protocol

use crate::direction::{is_nonzero, Direction, Still};
use crate::error::{AppResult, FdmError};
use crate::experiment::engine::TestEngine;
use crate::experiment::results::{TestResult, TestType};
use crate::experiment::zeroing::ZeroingState;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Tolerance for comparing accumulated displacements against limits.
const DISPLACEMENT_EPSILON: f64 = 1e-9;

/// The smooth drain deadline is this multiple of the nominal motion time...
const SMOOTH_DEADLINE_FACTOR: f64 = 1.5;
/// ...plus this much slack.
const SMOOTH_DEADLINE_SLACK: Duration = Duration::from_secs(2);

/// Careful (stepwise) test parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarefulParams {
    /// Step per measurement (mm)
    pub step: f64,
    /// Test direction
    pub direction: Direction,
    /// Readings averaged per step
    pub n_samples: usize,
    /// Travel before snap-through detection starts (mm)
    pub min_displacement: f64,
    /// Travel limit (mm)
    pub stop_after: f64,
    /// Test number recorded on each row
    pub test_no: u32,
    /// Retract to zero afterwards
    pub return_to_zero: bool,
}

/// Smooth (continuous) test parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothParams {
    /// Total displacement (mm)
    pub target: f64,
    /// Test direction
    pub direction: Direction,
    /// Move feedrate (mm/min)
    pub feedrate: f64,
    /// Zero toward `direction` (without backoff) first, leaving the probe touching
    pub zero_first: bool,
    /// Test number recorded on each row
    pub test_no: u32,
    /// Retract to zero afterwards
    pub return_to_zero: bool,
}

/// Protocol used by each half of a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoopMode {
    /// Careful halves
    Careful {
        /// Step per measurement (mm)
        step: f64,
        /// Readings averaged per step
        n_samples: usize,
    },
    /// Smooth halves
    Smooth {
        /// Displacement per half when no caps are given (mm)
        target: f64,
        /// Move feedrate (mm/min)
        feedrate: f64,
        /// Zero before each half
        zero_first: bool,
    },
}

/// Repeated-cycle parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopParams {
    /// Protocol per half
    pub mode: LoopMode,
    /// Number of up/down cycles
    pub repetitions: u32,
    /// Direction of the first half
    pub start_direction: Direction,
    /// First test number
    pub test_no: u32,
    /// Fixed travel moving down; requires `max_up`
    pub max_down: Option<f64>,
    /// Fixed travel moving up; requires `max_down`
    pub max_up: Option<f64>,
    /// Careful snap-through detection start when uncapped (mm)
    pub min_displacement: f64,
    /// Careful travel limit when uncapped (mm)
    pub stop_after: f64,
}

impl TestEngine {
    /// Stepwise test. Returns the rows recorded while stepping.
    ///
    /// After nulling any residual force, the probe creeps in fine increments until it touches.
    /// From there each step averages `n_samples` readings and records a row; the test ends at
    /// the first reading at or past `min_displacement` whose direction is not the test
    /// direction (snap-through), or once `stop_after` is reached.
    ///
    /// # Errors
    /// - `Configuration` if `min_displacement` exceeds `stop_after` or the step is not positive
    /// - `ZeroingFailed` if the pre-move finds no contact, or contact pushes against the test
    ///   direction
    pub async fn careful_test(&mut self, params: &CarefulParams) -> AppResult<Vec<TestResult>> {
        let direction = params.direction;
        if direction == Still {
            return Err(FdmError::InvalidDirection);
        }
        if params.step.is_nan() || params.step <= 0.0 {
            return Err(FdmError::Configuration(format!(
                "careful step must be positive, got {}",
                params.step
            )));
        }
        if params.min_displacement.abs() > params.stop_after.abs() {
            return Err(FdmError::Configuration(format!(
                "min_displacement {} must be <= stop_after {}",
                params.min_displacement.abs(),
                params.stop_after.abs()
            )));
        }
        info!(
            "Carefully testing moving {} by {}mm (test {})",
            direction, params.step, params.test_no
        );

        let force = self.motion.read_force().await?;
        if force != 0.0 {
            info!("Force isn't 0, it's {}", force);
            self.move_to_zero(None).await?;
        }

        let fine = self.motion.motion_config().fine_increment;
        let max_approach = self.motion.motion_config().max_approach_distance;
        let contact = self
            .motion
            .move_until(fine, direction, is_nonzero, max_approach)
            .await?;
        if !contact.reached {
            return Err(FdmError::ZeroingFailed(format!(
                "test pre-move found no contact after {:.3} mm",
                contact.distance
            )));
        }
        if Direction::from_force(contact.force) == direction.flip() {
            return Err(FdmError::ZeroingFailed(format!(
                "Force {} is in the opposite direction of the test ({})",
                contact.force, direction
            )));
        }
        info!("Contact at force {}, starting careful steps", contact.force);

        let signed_step = direction.signed(params.step)?;
        let min = params.min_displacement.abs();
        let max = params.stop_after.abs();
        let mut rows = Vec::new();
        let mut steps = 0u32;

        let (last_force, displacement) = loop {
            let displacement = f64::from(steps) * signed_step;
            let force = self.motion.average_force(params.n_samples).await?;
            rows.push(self.record(TestResult {
                timestamp: Utc::now(),
                direction,
                force,
                test_type: TestType::Careful,
                position: self.motion.try_position(),
                displacement: Some(displacement),
                test_no: params.test_no,
            }));

            let past_min = displacement.abs() + DISPLACEMENT_EPSILON >= min;
            let snapped = Direction::from_force(force) != direction;
            if past_min && snapped {
                info!("Snap-through at {:.3} (force {})", displacement, force);
                break (force, displacement);
            }
            if displacement.abs() + DISPLACEMENT_EPSILON >= max {
                info!("Reached stop_after {} without snap-through", max);
                break (force, displacement);
            }

            self.motion.move_by(params.step, direction, None, true).await?;
            steps += 1;
        };

        if last_force != 0.0 {
            self.move_to_zero(None).await?;
        }

        if params.return_to_zero {
            self.retract(direction, displacement).await?;
        }
        info!("End careful test {} ({} rows)", params.test_no, rows.len());
        Ok(rows)
    }

    /// Continuous test. Returns the initial row, one row per sample during the move up to and
    /// including the first whose direction differs from the test direction, and a final row at
    /// the target displacement.
    ///
    /// If sampling fails while the move is under way, the zero reference is dropped since the
    /// axis stopped at an unknown point.
    ///
    /// # Errors
    /// `Configuration` for a zero target or a non-positive feedrate; anything zeroing or
    /// sampling raises.
    pub async fn smooth_test(&mut self, params: &SmoothParams) -> AppResult<Vec<TestResult>> {
        let direction = params.direction;
        if direction == Still {
            return Err(FdmError::InvalidDirection);
        }
        if params.target.is_nan() || params.target == 0.0 {
            return Err(FdmError::Configuration(
                "smooth target displacement must be nonzero".to_string(),
            ));
        }
        if params.feedrate.is_nan() || params.feedrate <= 0.0 {
            return Err(FdmError::Configuration(format!(
                "smooth feedrate must be positive, got {}",
                params.feedrate
            )));
        }
        let feedrate = params.feedrate.min(self.motion.max_feedrate());
        let nominal = Duration::try_from_secs_f64(params.target.abs() / (feedrate / 60.0))
            .map_err(|e| {
                FdmError::Configuration(format!(
                    "smooth move of {} at F{} has no usable duration: {}",
                    params.target, feedrate, e
                ))
            })?;
        info!(
            "Smooth test moving {} by {}mm at F{} (test {})",
            direction, params.target, params.feedrate, params.test_no
        );

        if params.zero_first {
            self.zero_axis(direction, false).await?;
        }

        let start = self.motion.read_sample().await?;
        let mut rows = vec![self.record(TestResult {
            timestamp: start.timestamp,
            direction,
            force: start.value,
            test_type: TestType::Smooth,
            position: self.motion.try_position(),
            displacement: Some(0.0),
            test_no: params.test_no,
        })];

        let signed_target = self
            .motion
            .move_by(params.target.abs(), direction, Some(feedrate), false)
            .await?;

        let deadline = Instant::now() + nominal.mul_f64(SMOOTH_DEADLINE_FACTOR) + SMOOTH_DEADLINE_SLACK;
        let drained = self
            .drain_until_snap(direction, start.value, deadline, nominal, params.test_no)
            .await;
        match drained {
            Ok(more) => rows.extend(more),
            Err(e) => {
                self.abandon_motion();
                return Err(e);
            }
        }
        if let Err(e) = self.motion.wait_settled().await {
            self.abandon_motion();
            return Err(e);
        }
        let end = self.motion.read_sample().await?;
        rows.push(self.record(TestResult {
            timestamp: end.timestamp,
            direction,
            force: end.value,
            test_type: TestType::Smooth,
            position: self.motion.try_position(),
            displacement: Some(signed_target),
            test_no: params.test_no,
        }));

        if params.return_to_zero {
            self.retract(direction, signed_target).await?;
        }
        info!("End smooth test {} ({} rows)", params.test_no, rows.len());
        Ok(rows)
    }

    /// Run `repetitions` cycles numbered from `test_no`, each a half in the start direction and
    /// one back. Rows are concatenated.
    ///
    /// With caps, each half travels exactly its cap; without, careful halves detect
    /// snap-through and smooth halves use the mode's target. Halves never retract.
    ///
    /// # Errors
    /// `Configuration` if only one of `max_down` / `max_up` is given.
    pub async fn test_loop(&mut self, params: &LoopParams) -> AppResult<Vec<TestResult>> {
        if params.max_down.is_some() != params.max_up.is_some() {
            return Err(FdmError::Configuration(format!(
                "Both max_down and max_up must be specified (given: {:?}, {:?})",
                params.max_down, params.max_up
            )));
        }
        if params.start_direction == Still {
            return Err(FdmError::InvalidDirection);
        }

        let mut rows = Vec::new();
        let mut direction = params.start_direction;
        let last = params.test_no.saturating_add(params.repetitions);
        for test_no in params.test_no..last {
            info!(
                "Loop test {} ({} of {})",
                test_no,
                test_no - params.test_no + 1,
                params.repetitions
            );
            for _ in 0..2 {
                let cap = match direction {
                    Direction::Down => params.max_down,
                    Direction::Up => params.max_up,
                    Direction::Still => return Err(FdmError::InvalidDirection),
                };
                let half = match &params.mode {
                    LoopMode::Careful { step, n_samples } => {
                        self.careful_test(&CarefulParams {
                            step: *step,
                            direction,
                            n_samples: *n_samples,
                            min_displacement: cap.unwrap_or(params.min_displacement),
                            stop_after: cap.unwrap_or(params.stop_after),
                            test_no,
                            return_to_zero: false,
                        })
                        .await?
                    }
                    LoopMode::Smooth {
                        target,
                        feedrate,
                        zero_first,
                    } => {
                        self.smooth_test(&SmoothParams {
                            target: cap.unwrap_or(*target),
                            direction,
                            feedrate: *feedrate,
                            zero_first: *zero_first,
                            test_no,
                            return_to_zero: false,
                        })
                        .await?
                    }
                };
                rows.extend(half);
                direction = direction.flip();
            }
        }
        Ok(rows)
    }

    /// Record one row per sample until the force leaves the test direction or `deadline`
    /// passes.
    async fn drain_until_snap(
        &mut self,
        direction: Direction,
        first_force: f64,
        deadline: Instant,
        nominal: Duration,
        test_no: u32,
    ) -> AppResult<Vec<TestResult>> {
        let mut rows = Vec::new();
        let mut last_force = first_force;
        while Direction::from_force(last_force) == direction {
            let sample = match tokio::time::timeout_at(deadline, self.motion.read_sample()).await {
                Ok(sample) => sample?,
                Err(_) => {
                    warn!(
                        "No snap-through before the deadline of a {:?} move, stopping the drain",
                        nominal
                    );
                    break;
                }
            };
            rows.push(self.record(TestResult {
                timestamp: sample.timestamp,
                direction,
                force: sample.value,
                test_type: TestType::Smooth,
                position: None,
                displacement: None,
                test_no,
            }));
            last_force = sample.value;
        }
        Ok(rows)
    }

    /// Drop the zero reference after a failure during unconfirmed travel.
    fn abandon_motion(&mut self) {
        self.motion.abandon_pending();
        if !self.motion.is_zeroed() {
            self.zeroing = ZeroingState::UnZeroed;
        }
    }

    /// Return to position 0 if zeroed, else undo `displacement` of a test moving `direction`.
    async fn retract(&mut self, direction: Direction, displacement: f64) -> AppResult<()> {
        let feedrate = self.motion.motion_config().return_feedrate;
        match self.motion.try_position() {
            Some(position) => {
                info!("Returning to zero from {:.3}", position);
                self.motion
                    .move_by(position.abs(), Direction::of_distance(-position), Some(feedrate), true)
                    .await?;
            }
            None => {
                info!("Retracting {:.3}", displacement);
                self.motion
                    .move_by(displacement.abs(), direction.flip(), Some(feedrate), true)
                    .await?;
            }
        }
        Ok(())
    }
}
