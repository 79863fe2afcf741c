//! Serial Port Abstractions
//!
//! Shared types for the two serial links (actuator and gauge).
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`SharedPort`]: Thread-safe shared serial port with buffered reading
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking (requires `instrument_serial`)
//! - [`available_ports`]: List serial ports on this machine (requires `instrument_serial`)
//! - [`drain_serial_buffer`]: Drain stale data from a serial port
//!
//! # Example
//!
//! ```rust,ignore
//! use fdmeter::hardware::serial::{open_serial_async, wrap_shared, drain_serial_buffer};
//!
//! let port = open_serial_async("/dev/ttyUSB0", 115200, "Marlin").await?;
//! let shared = wrap_shared(Box::new(port));
//!
//! let mut guard = shared.lock().await;
//! let discarded = drain_serial_buffer(guard.get_mut(), 50).await;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Thread-safe shared serial port with buffered reading.
///
/// Marlin replies are line-delimited, so the `BufReader` gives us `read_line()`.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Create a SharedPort from a type-erased serial port.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "instrument_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Discard whatever the OS has buffered on the input side of `port`.
#[cfg(feature = "instrument_serial")]
pub fn clear_input(port: &tokio_serial::SerialStream) -> anyhow::Result<()> {
    use tokio_serial::SerialPort;
    port.clear(tokio_serial::ClearBuffer::Input)?;
    Ok(())
}

/// One serial port visible to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortListing {
    /// Device path (e.g. `/dev/ttyUSB0`, `COM3`)
    pub name: String,
    /// Human-readable description of the port type
    pub description: String,
}

/// List the serial ports available on this machine.
#[cfg(feature = "instrument_serial")]
pub fn available_ports() -> anyhow::Result<Vec<PortListing>> {
    use serialport::SerialPortType;

    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                SerialPortType::UsbPort(info) => match info.product {
                    Some(product) => format!("USB {:04x}:{:04x} {}", info.vid, info.pid, product),
                    None => format!("USB {:04x}:{:04x}", info.vid, info.pid),
                },
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::Unknown => "Unknown".to_string(),
            };
            PortListing {
                name: p.port_name,
                description,
            }
        })
        .collect())
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives for the rest of `timeout_ms`.
///
/// # Returns
///
/// Total number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break, // Timeout, no more immediate data
        }
    }

    total_discarded
}
