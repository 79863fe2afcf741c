//! Integration tests for the test protocols on simulated hardware
//!
//! A `MockActuator` drives a `SimulatedGauge` over a dome-shaped `SpecimenModel`, so zeroing,
//! careful and smooth tests and loops run end to end without a printer or gauge attached.

use fdmeter::config::Settings;
use fdmeter::direction::{Direction, Down, Up};
use fdmeter::error::FdmError;
use fdmeter::experiment::{
    CarefulParams, LoopMode, LoopParams, SmoothParams, TestEngine, TestResult, ZeroingState,
};
use fdmeter::hardware::mock::{
    MockActuator, MockCommand, ScriptedGauge, SimulatedGauge, SpecimenModel,
};
use std::sync::Arc;
use std::time::Duration;

fn instant_rig(surface: f64) -> (TestEngine, Arc<MockActuator>) {
    let axis = Arc::new(MockActuator::new(0.0).with_endstop(-40.0));
    let gauge = SimulatedGauge::new(axis.clone(), SpecimenModel::new(surface, 1.0, 1.5, 1.5))
        .with_period(Duration::ZERO);
    (
        TestEngine::new(axis.clone(), Arc::new(gauge), &Settings::default()),
        axis,
    )
}

fn careful(direction: Direction, stop_after: f64) -> CarefulParams {
    CarefulParams {
        step: 0.25,
        direction,
        n_samples: 1,
        min_displacement: 0.0,
        stop_after,
        test_no: 1,
        return_to_zero: true,
    }
}

fn magnitudes(rows: &[TestResult]) -> Vec<f64> {
    rows.iter()
        .filter_map(|r| r.displacement)
        .map(f64::abs)
        .collect()
}

// =============================================================================
// Careful test
// =============================================================================

#[tokio::test]
async fn test_careful_stops_at_snap_through() {
    let (mut engine, _axis) = instant_rig(-1.0);
    engine.zero_axis(Down, true).await.unwrap();
    assert_eq!(engine.zeroing_state(), ZeroingState::Zeroed);

    let rows = engine.careful_test(&careful(Down, 5.0)).await.unwrap();

    // Contact at the first fine step, snap once 1.5mm into the dome
    assert_eq!(rows.len(), 7);
    let displacements = magnitudes(&rows);
    assert!(displacements.windows(2).all(|w| w[1] > w[0]));
    assert_eq!(rows.last().unwrap().displacement, Some(-1.5));
    assert_eq!(rows.last().unwrap().force, 0.0);
    assert!(rows[..6]
        .iter()
        .all(|r| Direction::from_force(r.force) == Down));

    // Returned to the zero reference
    let position = engine.motion().position().unwrap();
    assert!(position.abs() < 1e-9, "ended at {}", position);
}

#[tokio::test]
async fn test_careful_gives_up_at_stop_after() {
    // Far stiffer snap than the travel allows
    let axis = Arc::new(MockActuator::new(0.0));
    let gauge = SimulatedGauge::new(axis.clone(), SpecimenModel::new(-1.0, 0.5, 6.0, 6.0))
        .with_period(Duration::ZERO);
    let mut engine = TestEngine::new(axis, Arc::new(gauge), &Settings::default());

    let mut params = careful(Down, 1.0);
    params.return_to_zero = false;
    let rows = engine.careful_test(&params).await.unwrap();

    assert_eq!(rows.len(), 5);
    assert_eq!(rows.last().unwrap().displacement, Some(-1.0));
    assert!(rows.iter().all(|r| r.force < 0.0));
}

#[tokio::test]
async fn test_careful_min_displacement_skips_early_zero() {
    let (mut engine, _axis) = instant_rig(-1.0);
    engine.zero_axis(Down, true).await.unwrap();

    let mut params = careful(Down, 2.0);
    params.min_displacement = 2.0;
    params.return_to_zero = false;
    let rows = engine.careful_test(&params).await.unwrap();

    // The snap at 1.5 is ignored; travel continues to the minimum
    assert_eq!(rows.len(), 9);
    assert_eq!(rows[6].force, 0.0);
    assert_eq!(rows.last().unwrap().displacement, Some(-2.0));
}

// =============================================================================
// Overload
// =============================================================================

#[tokio::test]
async fn test_overload_aborts_and_keeps_journal() {
    let axis = Arc::new(MockActuator::new(0.0));
    let gauge = Arc::new(ScriptedGauge::new([
        0.0, // residual check
        0.0, 0.0, 0.0, // stable start of the approach
        -0.1, // contact
        -0.1, -0.1, -0.1, // stable confirmation
        -0.5, // first row
        -3.6, // overload on the next step
    ]));
    let mut engine = TestEngine::new(axis.clone(), gauge, &Settings::default());

    let err = engine.careful_test(&careful(Down, 5.0)).await.unwrap_err();
    assert!(matches!(err, FdmError::Overload { force, .. } if force == -3.6));
    assert!(err.requires_stop());

    engine.emergency_stop().await.unwrap();
    assert_eq!(axis.commands().await.last(), Some(&MockCommand::Stop));

    let journal = engine.take_journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].force, -0.5);
    assert!(engine.journal().is_empty());
}

// =============================================================================
// Smooth test
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_smooth_records_until_snap() {
    let axis = Arc::new(MockActuator::new(0.0).with_endstop(-40.0).with_realtime());
    let gauge = SimulatedGauge::new(axis.clone(), SpecimenModel::default());
    let mut engine = TestEngine::new(axis.clone(), Arc::new(gauge), &Settings::default());

    let rows = engine
        .smooth_test(&SmoothParams {
            target: 3.0,
            direction: Down,
            feedrate: 180.0,
            zero_first: true,
            test_no: 4,
            return_to_zero: true,
        })
        .await
        .unwrap();

    let snap = rows
        .iter()
        .position(|r| Direction::from_force(r.force) != Down)
        .unwrap();
    assert_eq!(rows.len(), snap + 2);
    assert!(snap > 2, "only {} samples before snap-through", snap);

    assert_eq!(rows[0].displacement, Some(0.0));
    assert!(rows[1..=snap].iter().all(|r| r.displacement.is_none()));
    assert_eq!(rows.last().unwrap().displacement, Some(-3.0));
    assert!(rows.iter().all(|r| r.test_no == 4));

    // Forces grow while pushing
    assert!(rows[snap - 1].force < rows[0].force);

    let position = engine.motion().position().unwrap();
    assert!(position.abs() < 1e-9, "ended at {}", position);
}

// =============================================================================
// Loops
// =============================================================================

#[tokio::test]
async fn test_capped_careful_loop_alternates() {
    let (mut engine, _axis) = instant_rig(-1.0);
    engine.zero_axis(Down, true).await.unwrap();

    let rows = engine
        .test_loop(&LoopParams {
            mode: LoopMode::Careful {
                step: 0.25,
                n_samples: 1,
            },
            repetitions: 1,
            start_direction: Down,
            test_no: 1,
            max_down: Some(2.0),
            max_up: Some(1.0),
            min_displacement: 0.0,
            stop_after: 15.0,
        })
        .await
        .unwrap();

    let down: Vec<_> = rows.iter().filter(|r| r.direction == Down).collect();
    let up: Vec<_> = rows.iter().filter(|r| r.direction == Up).collect();
    assert_eq!(down.len(), 9);
    assert_eq!(up.len(), 5);
    assert_eq!(rows[0].direction, Down);
    assert_eq!(rows[9].direction, Up);
    assert_eq!(down.last().unwrap().displacement, Some(-2.0));
    assert_eq!(up.last().unwrap().displacement, Some(1.0));
    assert!(rows.iter().all(|r| r.test_no == 1));
    assert_eq!(engine.journal().len(), rows.len());
}

#[tokio::test]
async fn test_loop_runs_repetitions_from_first_test_number() {
    // Each smooth half: contact reading, snap on the first drained sample, confirmation
    let half_down = [-0.1, 0.0, 0.0];
    let half_up = [0.1, 0.0, 0.0];
    let script: Vec<f64> = (0..2)
        .flat_map(|_| half_down.iter().chain(half_up.iter()).copied())
        .collect();
    let axis = Arc::new(MockActuator::new(0.0));
    let mut engine = TestEngine::new(
        axis.clone(),
        Arc::new(ScriptedGauge::new(script)),
        &Settings::default(),
    );

    let rows = engine
        .test_loop(&LoopParams {
            mode: LoopMode::Smooth {
                target: 1.0,
                feedrate: 180.0,
                zero_first: false,
            },
            repetitions: 2,
            start_direction: Down,
            test_no: 5,
            max_down: None,
            max_up: None,
            min_displacement: 0.0,
            stop_after: 15.0,
        })
        .await
        .unwrap();

    let test_nos: Vec<u32> = rows.iter().map(|r| r.test_no).collect();
    assert_eq!(test_nos, [vec![5; 6], vec![6; 6]].concat());
    assert_eq!(axis.moves().await, vec![-1.0, 1.0, -1.0, 1.0]);
    assert_eq!(rows[3].direction, Up);
    assert_eq!(rows[6].direction, Down);
}

#[tokio::test]
async fn test_loop_without_rows_for_empty_range() {
    let (mut engine, axis) = instant_rig(-1.0);
    let rows = engine
        .test_loop(&LoopParams {
            mode: LoopMode::Careful {
                step: 0.25,
                n_samples: 1,
            },
            repetitions: 0,
            start_direction: Down,
            test_no: 1,
            max_down: None,
            max_up: None,
            min_displacement: 0.0,
            stop_after: 15.0,
        })
        .await
        .unwrap();
    assert!(rows.is_empty());
    assert!(axis.moves().await.is_empty());
}
