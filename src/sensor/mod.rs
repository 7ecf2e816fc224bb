//! Sensor Transport
//!
//! Byte-stream link to the sensor microcontroller. The control loop only sees
//! the two traits below; [`serial::SerialSensorOpener`] is the hardware
//! implementation and `hardware::mock` provides an in-process stub.
//!
//! # Contract
//! - `open` distinguishes `PermissionDenied` (port held by another process)
//!   from `PortUnavailable` (port missing or unusable)
//! - `try_read_line` never waits longer than the configured read timeout and
//!   returns `Ok(None)` when no complete line is buffered
//! - `close` consumes the link; callers invoke it on every exit path

pub mod serial;
pub mod voltage;

pub use serial::{SerialSensorLink, SerialSensorOpener};
pub use voltage::{parse_voltage_line, VoltageSample};

use crate::error::AppResult;
use async_trait::async_trait;

/// An open sensor link, exclusively owned by whoever opened it.
#[async_trait]
pub trait SensorLink: Send {
    /// Return the next complete line, or `None` if none is ready yet.
    async fn try_read_line(&mut self) -> AppResult<Option<String>>;

    /// Release the underlying OS handle.
    async fn close(self: Box<Self>) -> AppResult<()>;
}

/// Opens sensor links by port name.
#[async_trait]
pub trait SensorOpener: Send + Sync {
    /// Open the named port.
    async fn open(&self, port_name: &str) -> AppResult<Box<dyn SensorLink>>;
}
