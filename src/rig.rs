//! Assembling a test rig from settings.
//!
//! A [`Rig`] is a ready [`TestEngine`] plus, on real hardware, the gauge reader task feeding
//! it.

use crate::config::Settings;
use crate::error::AppResult;
use crate::experiment::engine::TestEngine;
use crate::hardware::force_gauge::GaugeReader;
use crate::hardware::mock::{MockActuator, SimulatedGauge, SpecimenModel};
use std::sync::Arc;
use tracing::{info, warn};

/// Simulated lower endstop (mm).
const SIMULATED_ENDSTOP: f64 = -40.0;

/// A connected engine and the tasks behind it.
pub struct Rig {
    /// The engine driving this rig
    pub engine: TestEngine,
    reader: Option<GaugeReader>,
}

impl Rig {
    /// Open both serial links, initialise the board and wait for the gauge to align.
    ///
    /// # Errors
    /// Missing port settings, unopenable ports, a board that does not initialise, or a gauge
    /// that never produces a first sample.
    #[cfg(feature = "instrument_serial")]
    pub async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        use crate::data::sample_channel::sample_channel;
        use crate::hardware::force_gauge::StreamDecoder;
        use crate::hardware::marlin::MarlinActuator;
        use crate::hardware::serial::{clear_input, open_serial_async};
        use anyhow::{anyhow, Context};

        let gauge_port = settings
            .gauge
            .port
            .as_deref()
            .ok_or_else(|| anyhow!("No force gauge port configured (gauge.port)"))?;
        let stream = open_serial_async(gauge_port, settings.gauge.baud_rate, "force gauge").await?;
        clear_input(&stream).context("Failed to clear force gauge input")?;

        let (sender, receiver) = sample_channel();
        let receiver = receiver.with_timeout(settings.gauge.sample_timeout());
        let decoder = StreamDecoder::new(settings.gauge.width, settings.gauge.max_force);
        let reader = GaugeReader::spawn(stream, decoder, sender);

        let first = receiver
            .get()
            .await
            .context("Force gauge produced no first reading")?;
        info!("Force gauge aligned, first reading {}", first.value);

        let actuator = MarlinActuator::connect(&settings.actuator).await?;
        let engine = TestEngine::new(Arc::new(actuator), Arc::new(receiver), settings);

        let rig = Self {
            engine,
            reader: Some(reader),
        };
        rig.log_initial_force().await;
        Ok(rig)
    }

    /// An engine over a simulated axis and dome-shaped specimen, moving in real time.
    pub async fn simulated(settings: &Settings) -> Self {
        let axis = Arc::new(
            MockActuator::new(0.0)
                .with_endstop(SIMULATED_ENDSTOP)
                .with_realtime(),
        );
        let gauge = SimulatedGauge::new(axis.clone(), SpecimenModel::default())
            .with_max_force(settings.gauge.max_force);
        info!("Using simulated hardware");

        let rig = Self {
            engine: TestEngine::new(axis, Arc::new(gauge), settings),
            reader: None,
        };
        rig.log_initial_force().await;
        rig
    }

    async fn log_initial_force(&self) {
        match self.engine.stable_force().await {
            Ok(force) => info!("Initial force: {}", force),
            Err(e) => warn!("Could not read a stable initial force: {}", e),
        }
    }

    /// Stop the gauge reader (a planned disconnect).
    pub async fn shutdown(mut self) -> AppResult<()> {
        if let Some(reader) = self.reader.take() {
            let decoder = reader.shutdown().await?;
            info!(
                "Gauge reader stopped ({} resyncs this session)",
                decoder.desync_count()
            );
        }
        Ok(())
    }
}
