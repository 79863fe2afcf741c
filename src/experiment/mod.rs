//! Experiment orchestration.
//!
//! [`MotionController`] turns raw actuator moves and sensor reads into force-guarded motion;
//! [`TestEngine`] builds zeroing and the test protocols on top of it.
//!
//! ```text
//! TestEngine ──> MotionController ──┬──> dyn Actuator     (MarlinActuator / MockActuator)
//!                                   └──> dyn ForceSensor  (SampleReceiver / SimulatedGauge)
//! ```

pub mod engine;
pub mod motion;
pub mod protocols;
pub mod results;
pub mod zeroing;

pub use engine::TestEngine;
pub use motion::{MotionController, SearchOutcome};
pub use protocols::{CarefulParams, LoopMode, LoopParams, SmoothParams};
pub use results::{TestParams, TestResult, TestRun, TestType};
pub use zeroing::ZeroingState;
