//! Hardware drivers and capability traits for the tester.
//!
//! - [`capabilities`]: `Actuator` and `ForceSensor`, the seams the engine is written against
//! - [`force_gauge`]: byte-stream decoder and the background reader task for the force gauge
//! - [`marlin`]: Z-axis control of a Marlin printer board over G-code
//! - [`serial`]: serial port plumbing shared by both links
//! - [`mock`]: simulated axis and gauges for tests and `--simulate`
//!
//! # Testing Strategy
//!
//! Serial drivers take any `AsyncRead + AsyncWrite` port, so tests hand them one end of a
//! `tokio::io::duplex` and script the device on the other end.

pub mod capabilities;
pub mod force_gauge;
pub mod marlin;
pub mod mock;
pub mod serial;

pub use capabilities::{Actuator, ForceSensor};
pub use force_gauge::{GaugeReader, StreamDecoder, WidthStrategy};
pub use marlin::MarlinActuator;
