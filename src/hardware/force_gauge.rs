//! Serial Force Gauge (ZP-50 family) Stream Decoder and Reader
//!
//! Protocol Overview:
//! - Format: fixed-width signed decimal ASCII, e.g. `-0.000`
//! - No delimiters or framing: readings arrive back to back (`-0.000-0.001-0.000...`)
//! - Baud: 2400, 8N1
//! - Width depends on the unit mode: 6 bytes (3 decimals) or 7 bytes (4 decimals)
//!
//! The only landmark in the stream is the sign byte, so the operator is asked to make the gauge
//! read negative while the decoder aligns. After alignment, records are sliced at the record
//! width. A record that fails to parse means we lost alignment; the decoder drops back to
//! searching for a sign byte without surfacing anything to the consumer.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use fdmeter::data::sample_channel::sample_channel;
//! use fdmeter::hardware::force_gauge::{GaugeReader, StreamDecoder, WidthStrategy};
//!
//! let (tx, rx) = sample_channel();
//! let decoder = StreamDecoder::new(WidthStrategy::Measured, 3.5);
//! let reader = GaugeReader::spawn(port, decoder, tx);
//! let sample = rx.get().await?;
//! ```

use crate::data::sample_channel::{ChannelFault, Sample, SampleSender};
use crate::error::{AppResult, FdmError};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Record widths the decoder accepts: `-X.XXX` and `-X.XXXX`.
pub const KNOWN_RECORD_WIDTHS: [usize; 2] = [6, 7];

/// Width assumed by the fixed strategy unless configured otherwise.
pub const DEFAULT_RECORD_WIDTH: usize = 6;

const SIGN: u8 = b'-';

/// Give up measuring after this many bytes without a second sign marker.
const MAX_MEASURE_SPAN: usize = 64;

/// How the decoder decides the record width.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidthStrategy {
    /// Measure the span between the first two sign markers.
    #[default]
    Measured,
    /// Always slice at this many bytes.
    Fixed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alignment {
    /// Discarding bytes until a sign byte
    Unaligned,
    /// Buffer starts with a sign byte; waiting for the next one
    Measuring,
    /// Slicing records of this width
    Aligned(usize),
}

/// Self-synchronizing decoder for the gauge's unframed byte stream.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: BytesMut,
    alignment: Alignment,
    strategy: WidthStrategy,
    max_force: f64,
    ready: bool,
    desyncs: u64,
}

impl StreamDecoder {
    /// Create a decoder that rejects readings with |value| >= `max_force`.
    pub fn new(strategy: WidthStrategy, max_force: f64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
            alignment: Alignment::Unaligned,
            strategy,
            max_force,
            ready: false,
            desyncs: 0,
        }
    }

    /// True once the first sign byte has been found on this connection.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Record width in use, once known.
    pub fn record_width(&self) -> Option<usize> {
        match self.alignment {
            Alignment::Aligned(width) => Some(width),
            _ => None,
        }
    }

    /// Number of times alignment was lost and recovered.
    pub fn desync_count(&self) -> u64 {
        self.desyncs
    }

    /// Forget everything: buffer, alignment, measured width and readiness.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.alignment = Alignment::Unaligned;
        self.ready = false;
    }

    /// Append bytes from the link and decode every complete record.
    ///
    /// Returns the decoded values in arrival order (possibly none).
    ///
    /// # Errors
    /// `FdmError::Overload` if any record reaches the rated maximum. Nothing from this chunk is
    /// returned in that case.
    pub fn feed(&mut self, data: &[u8]) -> AppResult<Vec<f64>> {
        self.buffer.extend_from_slice(data);
        let mut values = Vec::new();

        loop {
            match self.alignment {
                Alignment::Unaligned => {
                    let Some(start) = self.buffer.iter().position(|b| *b == SIGN) else {
                        self.buffer.clear();
                        return Ok(values);
                    };
                    self.buffer.advance(start);
                    self.alignment = match self.strategy {
                        WidthStrategy::Measured => Alignment::Measuring,
                        WidthStrategy::Fixed(width) => Alignment::Aligned(width),
                    };
                    if !self.ready {
                        self.ready = true;
                        tracing::info!("Force gauge stream aligned");
                    }
                }
                Alignment::Measuring => {
                    let next_sign = self.buffer[1..].iter().position(|b| *b == SIGN);
                    match next_sign {
                        Some(offset) => {
                            let span = offset + 1;
                            if KNOWN_RECORD_WIDTHS.contains(&span) {
                                tracing::info!(width = span, "Measured force gauge record width");
                                self.alignment = Alignment::Aligned(span);
                            } else {
                                // Re-anchor on the second marker and measure again
                                self.note_desync("unknown record width");
                                self.buffer.advance(span);
                            }
                        }
                        None if self.buffer.len() > MAX_MEASURE_SPAN => {
                            self.note_desync("no second sign marker");
                            self.buffer.advance(1);
                            self.alignment = Alignment::Unaligned;
                        }
                        None => return Ok(values),
                    }
                }
                Alignment::Aligned(width) => {
                    if self.buffer.len() < width {
                        return Ok(values);
                    }
                    match parse_record(&self.buffer[..width]) {
                        Some(value) => {
                            self.buffer.advance(width);
                            if value.abs() >= self.max_force {
                                return Err(FdmError::Overload {
                                    force: value,
                                    max: self.max_force,
                                });
                            }
                            values.push(value);
                        }
                        None => {
                            self.note_desync("unparseable record");
                            self.buffer.advance(1);
                            self.alignment = Alignment::Unaligned;
                        }
                    }
                }
            }
        }
    }

    fn note_desync(&mut self, reason: &str) {
        self.desyncs += 1;
        tracing::debug!(reason, desyncs = self.desyncs, "Force gauge stream desync, resyncing");
    }
}

/// Parse one fixed-width record. Padding whitespace and a leading `+` are accepted.
fn parse_record(record: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(record).ok()?.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit() || b"+-.".contains(&b)) {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

// =============================================================================
// GaugeReader - background decode task
// =============================================================================

/// Background task that owns the gauge link, decodes it, and publishes samples.
///
/// Dropping the reader (or calling [`GaugeReader::shutdown`]) is a planned disconnect: the
/// decoder is reset and no fault is published. EOF or a read error is an unplanned disconnect
/// and publishes `LinkLost`. An overload publishes `Overload` and stops the task, so nothing
/// more is published until a new reader is spawned.
pub struct GaugeReader {
    handle: JoinHandle<StreamDecoder>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl GaugeReader {
    /// Spawn the decode task on the current tokio runtime.
    pub fn spawn<R>(port: R, decoder: StreamDecoder, sender: SampleSender) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tracing::info!("Please make the force gauge read negative so the stream can align");
        let handle = tokio::spawn(read_loop(port, decoder, sender, shutdown_rx));
        Self {
            handle,
            shutdown: Some(shutdown_tx),
        }
    }

    /// Planned disconnect. Returns the (reset) decoder for reuse.
    pub async fn shutdown(mut self) -> anyhow::Result<StreamDecoder> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        Ok(self.handle.await?)
    }
}

async fn read_loop<R>(
    mut port: R,
    mut decoder: StreamDecoder,
    sender: SampleSender,
    mut shutdown: oneshot::Receiver<()>,
) -> StreamDecoder
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Force gauge reader shut down");
                decoder.reset();
                return decoder;
            }
            read = port.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        tracing::warn!("Force gauge link closed");
                        decoder.reset();
                        sender.fault(ChannelFault::LinkLost("end of stream".to_string()));
                        return decoder;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!(error = %e, "Force gauge connection lost");
                        decoder.reset();
                        sender.fault(ChannelFault::LinkLost(e.to_string()));
                        return decoder;
                    }
                };

                match decoder.feed(&buf[..n]) {
                    Ok(values) => {
                        for value in values {
                            sender.publish(Sample::now(value));
                        }
                    }
                    Err(FdmError::Overload { force, max }) => {
                        tracing::error!(force, max, "Force gauge overload, no further samples");
                        decoder.reset();
                        sender.fault(ChannelFault::Overload { force, max });
                        return decoder;
                    }
                    Err(e) => {
                        decoder.reset();
                        sender.fault(ChannelFault::LinkLost(e.to_string()));
                        return decoder;
                    }
                }
            }
        }
    }
}
