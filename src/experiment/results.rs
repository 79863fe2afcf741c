//! Test result records.
//!
//! A [`TestRun`] is what gets persisted: the parameters that produced it and the rows observed.

use crate::direction::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which protocol produced a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    /// Step, settle, sample
    Careful,
    /// One continuous move, sampled on the fly
    Smooth,
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestType::Careful => write!(f, "careful"),
            TestType::Smooth => write!(f, "smooth"),
        }
    }
}

impl FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "careful" => Ok(TestType::Careful),
            "smooth" => Ok(TestType::Smooth),
            other => Err(format!(
                "Invalid test type '{}'. Must be 'careful' or 'smooth'",
                other
            )),
        }
    }
}

/// One observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// When the force was sampled
    pub timestamp: DateTime<Utc>,
    /// Test direction
    pub direction: Direction,
    /// Force reading (averaged for careful rows)
    pub force: f64,
    /// Producing protocol
    pub test_type: TestType,
    /// Axis position relative to zero, if zeroed
    pub position: Option<f64>,
    /// Signed distance from the start of the test; absent for in-motion smooth rows
    pub displacement: Option<f64>,
    /// Test number within a loop
    pub test_no: u32,
}

/// Parameters that produced a run, stored alongside the rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestParams {
    /// Protocol used
    pub test_type: TestType,
    /// First test direction
    pub test_direction: Direction,
    /// Feedrate for smooth moves (mm/min)
    pub feedrate: f64,
    /// Loop repetitions (0 = single test)
    pub test_loops: u32,
    /// First test number
    pub test_num: u32,
    /// Whether single tests retract afterwards
    pub return_to_zero_after_test: bool,
    /// Smooth target displacement (mm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smooth_displacement: Option<f64>,
    /// Samples averaged per careful step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_samples: Option<usize>,
    /// Careful step size (mm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub careful_inc: Option<f64>,
    /// Careful travel limit (mm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_after: Option<f64>,
    /// Loop cap moving down (mm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_down: Option<f64>,
    /// Loop cap moving up (mm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_up: Option<f64>,
}

/// Immutable record handed to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    /// Parameter block
    pub test_params: TestParams,
    /// Rows in observation order
    pub test_results: Vec<TestResult>,
}

impl TestRun {
    /// Bundle parameters and rows.
    pub fn new(test_params: TestParams, test_results: Vec<TestResult>) -> Self {
        Self {
            test_params,
            test_results,
        }
    }

    /// Displacement of the last row that has one.
    pub fn final_displacement(&self) -> Option<f64> {
        self.test_results.iter().rev().find_map(|r| r.displacement)
    }
}
