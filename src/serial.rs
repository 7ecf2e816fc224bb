//! Serial Port Abstractions
//!
//! Shared types and utilities for the two serial peripherals (sensor
//! microcontroller and motion controller).
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`SharedPort`]: Thread-safe shared serial port with buffered reading
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking, classifying failures
//! - [`drain_serial_buffer`]: Drain stale data from a serial port

use crate::error::{AppResult, ControlError};
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
/// The `BufReader` wrapper enables `read_line()` for the line-delimited
/// ASCII protocols both peripherals speak.
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
/// - [`ControlError::PermissionDenied`] if the OS refused access (port held elsewhere)
/// - [`ControlError::PortUnavailable`] for every other open failure
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    let opened = spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| ControlError::PortUnavailable {
        port: port_path.to_string(),
        reason: format!("spawn_blocking for serial port opening failed: {}", e),
    })?;

    opened.map_err(|e| {
        let err = classify_open_error(port_path, &e);
        tracing::warn!(port = port_path, device = device_name, error = %e, "Serial open failed");
        err
    })
}

/// Map a serial open failure onto the error taxonomy.
///
/// Windows reports a held port as "Access is denied", Linux as `EACCES` or
/// `EBUSY`; all of them mean another process has the port.
pub fn classify_open_error(port_path: &str, err: &tokio_serial::Error) -> ControlError {
    let description = err.description.to_lowercase();
    let denied = matches!(
        err.kind,
        tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied)
    ) || description.contains("denied")
        || description.contains("resource busy");

    if denied {
        ControlError::PermissionDenied {
            port: port_path.to_string(),
        }
    } else {
        ControlError::PortUnavailable {
            port: port_path.to_string(),
            reason: err.description.clone(),
        }
    }
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards data until nothing arrives within `timeout_ms`.
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        if tokio::time::Instant::now() >= deadline {
            break;
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}
