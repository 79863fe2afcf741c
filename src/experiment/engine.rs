//! The test engine.
//!
//! [`TestEngine`] wraps a [`MotionController`] and adds the procedures: axis zeroing
//! (`zeroing.rs`), the careful and smooth protocols and the repeated loop (`protocols.rs`).
//!
//! Every row a protocol records is also appended to the engine's journal, so the rows of a run
//! that fails part-way can still be saved.

use crate::config::Settings;
use crate::error::AppResult;
use crate::experiment::motion::MotionController;
use crate::experiment::results::TestResult;
use crate::experiment::zeroing::ZeroingState;
use crate::hardware::capabilities::{Actuator, ForceSensor};
use std::sync::Arc;

/// Zeroing, stabilization and test protocols over one axis and one gauge.
pub struct TestEngine {
    pub(crate) motion: MotionController,
    pub(crate) zeroing: ZeroingState,
    journal: Vec<TestResult>,
}

impl TestEngine {
    /// Build an engine over the given hardware.
    pub fn new(
        actuator: Arc<dyn Actuator>,
        sensor: Arc<dyn ForceSensor>,
        settings: &Settings,
    ) -> Self {
        Self::with_controller(MotionController::new(actuator, sensor, settings))
    }

    /// Build an engine around an existing controller.
    pub fn with_controller(motion: MotionController) -> Self {
        Self {
            motion,
            zeroing: ZeroingState::UnZeroed,
            journal: Vec::new(),
        }
    }

    /// The motion controller.
    pub fn motion(&self) -> &MotionController {
        &self.motion
    }

    /// The motion controller, mutably (for jogging and manual moves).
    pub fn motion_mut(&mut self) -> &mut MotionController {
        &mut self.motion
    }

    /// Current zeroing state.
    pub fn zeroing_state(&self) -> ZeroingState {
        self.zeroing
    }

    /// Stabilized force using the configured run length and sample budget.
    pub async fn stable_force(&self) -> AppResult<f64> {
        self.motion.stable_force().await
    }

    /// Rows recorded so far and not yet taken.
    pub fn journal(&self) -> &[TestResult] {
        &self.journal
    }

    /// Take every journaled row, leaving the journal empty.
    pub fn take_journal(&mut self) -> Vec<TestResult> {
        std::mem::take(&mut self.journal)
    }

    /// Stop the axis immediately.
    pub async fn emergency_stop(&self) -> AppResult<()> {
        tracing::error!("Emergency stop");
        self.motion.stop().await
    }

    pub(crate) fn record(&mut self, row: TestResult) -> TestResult {
        tracing::info!(
            test_no = row.test_no,
            direction = %row.direction,
            position = ?row.position,
            displacement = ?row.displacement,
            force = row.force,
            "{} row",
            row.test_type
        );
        self.journal.push(row.clone());
        row
    }
}
