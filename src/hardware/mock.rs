//! Mock Hardware Implementations
//!
//! Simulated devices for tests and for `--simulate` runs. All mocks use async-safe operations
//! (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockActuator` - Z axis with optional real-time motion, command log and endstop
//! - `SimulatedGauge` - Force gauge reading a `SpecimenModel` at the actuator's live position
//! - `ScriptedGauge` - Force gauge replaying a fixed list of readings
//!
//! # Performance Characteristics
//!
//! - MockActuator: instantaneous by default; `with_realtime()` moves at the commanded feedrate
//! - SimulatedGauge: one sample per 25ms (a 2400 baud gauge sending 6-byte records)

use crate::data::sample_channel::Sample;
use crate::error::FdmError;
use crate::hardware::capabilities::{Actuator, ForceSensor};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep_until, Duration, Instant};

// =============================================================================
// MockActuator - Simulated Z Axis
// =============================================================================

/// One command received by a [`MockActuator`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    /// `move_rel(distance, feedrate)`
    Move {
        /// Signed distance (mm)
        distance: f64,
        /// Requested feedrate (mm/min)
        feedrate: Option<f64>,
    },
    /// `wait_settled()`
    Wait,
    /// `endstop_triggered()`
    Endstop,
    /// `stop()`
    Stop,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: Instant,
    end: Instant,
    from: f64,
    to: f64,
}

impl Segment {
    fn position_at(&self, now: Instant) -> f64 {
        if now >= self.end {
            return self.to;
        }
        if now <= self.start {
            return self.from;
        }
        let total = (self.end - self.start).as_secs_f64();
        let done = (now - self.start).as_secs_f64();
        self.from + (self.to - self.from) * done / total
    }
}

#[derive(Debug)]
struct AxisState {
    /// Position once every queued segment has finished
    planned: f64,
    /// Feedrate currently in effect (mm/min)
    feedrate: f64,
    segments: VecDeque<Segment>,
}

impl AxisState {
    fn position_at(&self, now: Instant) -> f64 {
        let mut position = self.segments.front().map_or(self.planned, |s| s.from);
        for segment in &self.segments {
            if segment.start > now {
                break;
            }
            position = segment.position_at(now);
        }
        position
    }

    fn busy_until(&self) -> Option<Instant> {
        self.segments.back().map(|s| s.end)
    }
}

/// Mock Z axis
///
/// Simulates a printer axis in relative mode with:
/// - Absolute position tracking (mm, up positive)
/// - Optional real-time motion at the commanded feedrate
/// - A lower endstop at a fixed height
/// - A log of every command received
///
/// # Example
///
/// ```rust,ignore
/// let axis = MockActuator::new(10.0);
/// axis.move_rel(-0.5, None).await?;
/// assert_eq!(axis.position().await, 9.5);
/// ```
pub struct MockActuator {
    state: RwLock<AxisState>,
    commands: Mutex<Vec<MockCommand>>,
    endstop_at: Option<f64>,
    realtime: bool,
}

impl MockActuator {
    /// Create an instantaneous axis at `position` mm with no endstop.
    pub fn new(position: f64) -> Self {
        Self {
            state: RwLock::new(AxisState {
                planned: position,
                feedrate: 180.0,
                segments: VecDeque::new(),
            }),
            commands: Mutex::new(Vec::new()),
            endstop_at: None,
            realtime: false,
        }
    }

    /// Endstop reads triggered at or below `height` mm.
    pub fn with_endstop(mut self, height: f64) -> Self {
        self.endstop_at = Some(height);
        self
    }

    /// Move at the commanded feedrate instead of instantly.
    pub fn with_realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Live position (mid-move positions are interpolated).
    pub async fn position(&self) -> f64 {
        self.state.read().await.position_at(Instant::now())
    }

    /// Every command received so far.
    pub async fn commands(&self) -> Vec<MockCommand> {
        self.commands.lock().await.clone()
    }

    /// Signed distances of every move received so far.
    pub async fn moves(&self) -> Vec<f64> {
        self.commands
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                MockCommand::Move { distance, .. } => Some(*distance),
                _ => None,
            })
            .collect()
    }

    async fn log(&self, command: MockCommand) {
        self.commands.lock().await.push(command);
    }
}

#[async_trait]
impl Actuator for MockActuator {
    async fn move_rel(&self, distance: f64, feedrate: Option<f64>) -> Result<()> {
        self.log(MockCommand::Move { distance, feedrate }).await;

        let mut state = self.state.write().await;
        if let Some(f) = feedrate {
            state.feedrate = f;
        }
        let now = Instant::now();
        while state.segments.front().is_some_and(|s| s.end <= now) {
            state.segments.pop_front();
        }

        let from = state.planned;
        let to = from + distance;
        if self.realtime && state.feedrate > 0.0 {
            let start = state.busy_until().map_or(now, |end| end.max(now));
            let duration = Duration::from_secs_f64(distance.abs() / (state.feedrate / 60.0));
            state.segments.push_back(Segment {
                start,
                end: start + duration,
                from,
                to,
            });
        }
        state.planned = to;
        tracing::debug!(from, to, "MockActuator: move queued");
        Ok(())
    }

    async fn wait_settled(&self) -> Result<()> {
        self.log(MockCommand::Wait).await;
        let busy_until = self.state.read().await.busy_until();
        if let Some(end) = busy_until {
            sleep_until(end).await;
        }
        Ok(())
    }

    async fn endstop_triggered(&self) -> Result<bool> {
        self.log(MockCommand::Endstop).await;
        let position = self.position().await;
        Ok(self.endstop_at.is_some_and(|h| position <= h))
    }

    async fn stop(&self) -> Result<()> {
        self.log(MockCommand::Stop).await;
        let mut state = self.state.write().await;
        let here = state.position_at(Instant::now());
        state.segments.clear();
        state.planned = here;
        tracing::warn!(position = here, "MockActuator: stopped");
        Ok(())
    }
}

// =============================================================================
// SpecimenModel - bistable dome
// =============================================================================

/// Force response of a bistable (snap-through) specimen under the probe.
///
/// Heights are absolute axis positions in mm. Pushing reads negative, pulling positive, and
/// every reading is quantized to the gauge's 0.001 resolution.
///
/// - Resting: no force above `surface`; compressing below it at `stiffness` per mm until the
///   probe is `snap_depth` below the surface, where the dome inverts and the force drops to 0.
/// - Inverted: the dome now rests at `surface - snap_depth`. Pulling above that reads positive
///   until the probe has risen `tension_depth`, where it snaps back.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecimenModel {
    /// Height of the resting dome's top
    pub surface: f64,
    /// Force per mm of compression or tension
    pub stiffness: f64,
    /// Compression at which the dome inverts
    pub snap_depth: f64,
    /// Tension at which the inverted dome snaps back
    pub tension_depth: f64,
    inverted: bool,
}

impl SpecimenModel {
    /// A resting dome.
    pub fn new(surface: f64, stiffness: f64, snap_depth: f64, tension_depth: f64) -> Self {
        Self {
            surface,
            stiffness,
            snap_depth,
            tension_depth,
            inverted: false,
        }
    }

    /// Whether the dome has snapped through.
    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    /// Force with the probe at `height`, updating the snap state.
    pub fn force_at(&mut self, height: f64) -> f64 {
        let raw = if self.inverted {
            let rest = self.surface - self.snap_depth;
            if height >= rest + self.tension_depth {
                self.inverted = false;
                self.resting_force(height)
            } else if height >= rest {
                self.stiffness * (height - rest)
            } else {
                -self.stiffness * (rest - height)
            }
        } else if self.surface - height >= self.snap_depth {
            self.inverted = true;
            0.0
        } else {
            self.resting_force(height)
        };
        quantize(raw)
    }

    fn resting_force(&self, height: f64) -> f64 {
        let depth = self.surface - height;
        if depth > 0.0 {
            -self.stiffness * depth
        } else {
            0.0
        }
    }
}

impl Default for SpecimenModel {
    /// A dome 2mm below the axis origin: 1 N/mm, snaps at 1.5mm, snaps back after 1.5mm.
    fn default() -> Self {
        Self::new(-2.0, 1.0, 1.5, 1.5)
    }
}

fn quantize(force: f64) -> f64 {
    // +0.0 folds -0.0 into 0.0
    (force * 1000.0).round() / 1000.0 + 0.0
}

// =============================================================================
// SimulatedGauge - force from the live actuator position
// =============================================================================

/// Force gauge that samples a [`SpecimenModel`] at the [`MockActuator`]'s live position.
pub struct SimulatedGauge {
    actuator: Arc<MockActuator>,
    specimen: Mutex<SpecimenModel>,
    period: Duration,
    max_force: f64,
}

impl SimulatedGauge {
    /// Sample every 25ms with a 3.5 overload threshold.
    pub fn new(actuator: Arc<MockActuator>, specimen: SpecimenModel) -> Self {
        Self {
            actuator,
            specimen: Mutex::new(specimen),
            period: Duration::from_millis(25),
            max_force: 3.5,
        }
    }

    /// Override the sample period (zero yields instead of sleeping).
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Override the overload threshold.
    pub fn with_max_force(mut self, max_force: f64) -> Self {
        self.max_force = max_force;
        self
    }

    /// Snapshot of the specimen state.
    pub async fn specimen(&self) -> SpecimenModel {
        self.specimen.lock().await.clone()
    }
}

#[async_trait]
impl ForceSensor for SimulatedGauge {
    async fn next_sample(&self) -> Result<Sample> {
        if self.period.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.period).await;
        }

        let height = self.actuator.position().await;
        let force = self.specimen.lock().await.force_at(height);
        if force.abs() >= self.max_force {
            return Err(FdmError::Overload {
                force,
                max: self.max_force,
            }
            .into());
        }
        Ok(Sample::now(force))
    }
}

// =============================================================================
// ScriptedGauge - canned readings
// =============================================================================

/// Force gauge that returns a fixed sequence of readings, then repeats the last one.
pub struct ScriptedGauge {
    script: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
    max_force: Option<f64>,
    served: std::sync::atomic::AtomicUsize,
}

impl ScriptedGauge {
    /// Replay `readings` in order.
    pub fn new<I: IntoIterator<Item = f64>>(readings: I) -> Self {
        Self {
            script: Mutex::new(readings.into_iter().collect()),
            last: Mutex::new(0.0),
            max_force: None,
            served: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Readings at or above `max_force` are reported as overloads.
    pub fn with_max_force(mut self, max_force: f64) -> Self {
        self.max_force = Some(max_force);
        self
    }

    /// Number of readings handed out so far.
    pub fn served(&self) -> usize {
        self.served.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ForceSensor for ScriptedGauge {
    async fn next_sample(&self) -> Result<Sample> {
        tokio::task::yield_now().await;
        let mut last = self.last.lock().await;
        if let Some(next) = self.script.lock().await.pop_front() {
            *last = next;
        }
        self.served
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        if let Some(max) = self.max_force {
            if last.abs() >= max {
                return Err(FdmError::Overload { force: *last, max }.into());
            }
        }
        Ok(Sample::now(*last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_axis_tracks_position_and_log() {
        let axis = MockActuator::new(0.0).with_endstop(-5.0);
        axis.move_rel(-3.0, None).await.unwrap();
        axis.move_rel(-2.5, Some(120.0)).await.unwrap();
        axis.wait_settled().await.unwrap();

        assert_eq!(axis.position().await, -5.5);
        assert!(axis.endstop_triggered().await.unwrap());
        assert_eq!(axis.moves().await, vec![-3.0, -2.5]);
        assert_eq!(axis.commands().await[2], MockCommand::Wait);
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_axis_interpolates_mid_move() {
        let axis = MockActuator::new(0.0).with_realtime();
        // 60 mm/min = 1 mm/s
        axis.move_rel(-2.0, Some(60.0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let mid = axis.position().await;
        assert!((mid + 0.5).abs() < 1e-6, "mid-move position {}", mid);

        axis.wait_settled().await.unwrap();
        assert_eq!(axis.position().await, -2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_freezes_the_axis() {
        let axis = MockActuator::new(0.0).with_realtime();
        axis.move_rel(-2.0, Some(60.0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        axis.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!((axis.position().await + 1.0).abs() < 1e-6);
    }

    #[test]
    fn specimen_snaps_through_and_back() {
        let mut dome = SpecimenModel::new(0.0, 1.0, 1.0, 1.0);
        assert_eq!(dome.force_at(0.5), 0.0);
        assert_eq!(dome.force_at(-0.4), -0.4);
        assert_eq!(dome.force_at(-1.0), 0.0);
        assert!(dome.is_inverted());

        // Inverted dome rests at -1.0: pulling reads positive
        assert_eq!(dome.force_at(-0.7), 0.3);
        assert_eq!(dome.force_at(0.0), 0.0);
        assert!(!dome.is_inverted());
    }

    #[tokio::test]
    async fn scripted_gauge_repeats_last_and_overloads() {
        let gauge = ScriptedGauge::new([-0.1, -0.2]).with_max_force(3.5);
        assert_eq!(gauge.next_sample().await.unwrap().value, -0.1);
        assert_eq!(gauge.next_sample().await.unwrap().value, -0.2);
        assert_eq!(gauge.next_sample().await.unwrap().value, -0.2);
        assert_eq!(gauge.served(), 3);

        let gauge = ScriptedGauge::new([4.0]).with_max_force(3.5);
        let err = gauge.next_sample().await.unwrap_err();
        assert!(matches!(
            FdmError::from(err),
            FdmError::Overload { force, .. } if force == 4.0
        ));
    }

    #[tokio::test]
    async fn simulated_gauge_follows_the_axis() {
        let axis = Arc::new(MockActuator::new(0.0));
        let gauge = SimulatedGauge::new(axis.clone(), SpecimenModel::new(-1.0, 2.0, 1.0, 1.0))
            .with_period(Duration::ZERO);

        assert_eq!(gauge.next_sample().await.unwrap().value, 0.0);
        axis.move_rel(-1.25, None).await.unwrap();
        assert_eq!(gauge.next_sample().await.unwrap().value, -0.5);
    }
}
