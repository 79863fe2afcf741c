//! Marlin G-code Z-Axis Driver
//!
//! Drives the Z axis of a Marlin-based 3D printer as a single linear actuator.
//!
//! Protocol Overview:
//! - Format: newline-terminated G-code over USB serial
//! - Baud: 115200, 8N1
//! - Every command is acknowledged with a line starting with `ok`; anything before it is the
//!   command's response
//! - `G0` is acknowledged as soon as the move is queued, `M400` only once all moves finished
//!
//! Initialisation puts the axis in relative mode and disables the Z stepper idle timeout so the
//! carriage holds position while a specimen is loaded.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use fdmeter::hardware::marlin::MarlinActuator;
//!
//! let axis = MarlinActuator::connect(&settings.actuator).await?;
//! axis.move_rel(-0.5, Some(180.0)).await?;
//! axis.wait_settled().await?;
//! ```

use crate::config::ActuatorConfig;
use crate::hardware::capabilities::Actuator;
use crate::hardware::serial::{drain_serial_buffer, DynSerial, SharedPort};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::MutexGuard;
use tracing::instrument;

const ENDSTOP_TRIGGERED: &str = "z_min: TRIGGERED";
const ENDSTOP_OPEN: &str = "z_min: open";

/// Driver for the Z axis of a Marlin printer board.
pub struct MarlinActuator {
    /// Serial port protected by Mutex for exclusive access
    port: SharedPort,
    /// How long to wait for an `ok`
    ack_timeout: Duration,
    /// Extra `M119` attempts after an ambiguous answer
    endstop_retries: u32,
    /// Feedrate set during initialisation (mm/min)
    default_feedrate: f64,
}

impl MarlinActuator {
    /// Open the configured port and initialise the board.
    ///
    /// # Errors
    /// Returns error if:
    /// - No port is configured or it cannot be opened
    /// - The board does not acknowledge the initialisation sequence
    #[cfg(feature = "instrument_serial")]
    pub async fn connect(config: &ActuatorConfig) -> Result<Self> {
        use crate::hardware::serial::{open_serial_async, wrap_shared};

        let path = config
            .port
            .as_deref()
            .ok_or_else(|| anyhow!("No actuator port configured (actuator.port)"))?;
        let port = open_serial_async(path, config.baud_rate, "Marlin").await?;

        let driver = Self::with_port(wrap_shared(Box::new(port)), config);
        driver
            .initialize()
            .await
            .with_context(|| format!("Marlin board on {} did not initialise", path))?;
        Ok(driver)
    }

    /// Wrap an already-open port. Call [`MarlinActuator::initialize`] before moving.
    pub fn with_port(port: SharedPort, config: &ActuatorConfig) -> Self {
        Self {
            port,
            ack_timeout: Duration::from_secs(config.ack_timeout_secs),
            endstop_retries: config.endstop_retries,
            default_feedrate: config.default_feedrate,
        }
    }

    /// Fan off, relative positioning, no Z idle timeout, default feedrate.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> Result<()> {
        let position = self.gcode("M114").await?;
        tracing::info!(%position, "Marlin reports position");
        self.gcode("M107").await?;
        self.gcode("G91").await?;
        self.gcode("M18 S0 Z").await?;
        self.gcode(&format!("G0 Z0 F{}", self.default_feedrate))
            .await?;
        Ok(())
    }

    /// Send one command and wait for its `ok`. Returns whatever the board printed before it.
    pub async fn gcode(&self, command: &str) -> Result<String> {
        let mut port = self.port.lock().await;
        self.exchange(&mut port, command).await
    }

    async fn exchange(
        &self,
        port: &mut MutexGuard<'_, BufReader<DynSerial>>,
        command: &str,
    ) -> Result<String> {
        tracing::debug!(gcode = command, "-> Marlin");

        let writer = port.get_mut();
        writer
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .context("Marlin write failed")?;
        writer.flush().await.context("Marlin flush failed")?;

        let read_response = async {
            let mut response = Vec::new();
            loop {
                let mut line = String::new();
                let n = port
                    .read_line(&mut line)
                    .await
                    .context("Marlin read error")?;
                if n == 0 {
                    bail!("Marlin link closed while waiting for ok");
                }
                let line = line.trim();
                if line.starts_with("ok") {
                    return Ok(response.join("\n"));
                }
                if !line.is_empty() {
                    response.push(line.to_string());
                }
            }
        };

        let response = tokio::time::timeout(self.ack_timeout, read_response)
            .await
            .map_err(|_| {
                anyhow!(
                    "Marlin did not acknowledge '{}' within {:?}",
                    command,
                    self.ack_timeout
                )
            })??;

        if !response.is_empty() {
            tracing::debug!(response = %response, "<- Marlin");
        }
        Ok(response)
    }
}

/// Format a relative Z move.
fn move_command(distance: f64, feedrate: Option<f64>) -> String {
    match feedrate {
        Some(f) => format!("G0 Z{} F{}", distance, f),
        None => format!("G0 Z{}", distance),
    }
}

/// Interpret an `M119` report. `None` means ask again.
fn parse_endstop(report: &str) -> Option<bool> {
    if report.contains("Unknown") {
        return None;
    }
    if report.contains(ENDSTOP_TRIGGERED) {
        Some(true)
    } else if report.contains(ENDSTOP_OPEN) {
        Some(false)
    } else {
        None
    }
}

#[async_trait]
impl Actuator for MarlinActuator {
    #[instrument(skip(self), err)]
    async fn move_rel(&self, distance: f64, feedrate: Option<f64>) -> Result<()> {
        self.gcode(&move_command(distance, feedrate)).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn wait_settled(&self) -> Result<()> {
        self.gcode("M400").await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn endstop_triggered(&self) -> Result<bool> {
        let mut port = self.port.lock().await;

        // Stale chatter would otherwise be taken for the report
        let buffered = port.buffer().len();
        port.consume(buffered);
        let discarded = drain_serial_buffer(port.get_mut(), 20).await;
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded stale bytes before M119");
        }

        let mut last = String::new();
        for attempt in 0..=self.endstop_retries {
            let report = self.exchange(&mut port, "M119").await?;
            if let Some(triggered) = parse_endstop(&report) {
                return Ok(triggered);
            }
            tracing::debug!(attempt, report = %report, "Ambiguous endstop report, asking again");
            last = report;
        }
        Err(anyhow!(
            "No `{}` or `{}` in endstop report after {} attempts: {}",
            ENDSTOP_TRIGGERED,
            ENDSTOP_OPEN,
            self.endstop_retries + 1,
            last
        ))
    }

    #[instrument(skip(self), err)]
    async fn stop(&self) -> Result<()> {
        tracing::warn!("Emergency stop (M410)");
        self.gcode("M410").await?;
        Ok(())
    }
}
