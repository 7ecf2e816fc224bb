//! Zaber ASCII Motion Controller Driver
//!
//! Reference: Zaber ASCII Protocol Manual
//!
//! Protocol Overview:
//! - Format: ASCII command/reply over RS-232 / USB-serial
//! - Baud: 115200, 8N1, no flow control
//! - Commands: `/{device} {axis} {command} {data}\n`
//! - Replies: `@{device} {axis} {OK|RJ} {IDLE|BUSY} {flag} {data}\r\n`
//! - Example: `/1 1 move rel 21000` → `@01 1 OK BUSY -- 0`
//!
//! Positions travel as integer microsteps and speeds as microsteps/s × 1.6384;
//! [`UnitConversion`] maps them to mm and mm/s.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stage_trigger::hardware::zaber::ZaberConnector;
//!
//! let connector = ZaberConnector::new(&config.axis);
//! let connection = connector.connect("/dev/ttyUSB0").await?;
//! let position = connection.axis().get_position().await?;
//! connection.disconnect().await?;
//! ```

use crate::config::AxisConfig;
use crate::error::{AppResult, ControlError};
use crate::hardware::axis::{Axis, AxisConnection, AxisConnector, AxisHandle};
use crate::serial::{drain_serial_buffer, open_serial_async, wrap_shared, DynSerial, SharedPort};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

/// Native velocity = microsteps per second × 1.6384.
const VELOCITY_SCALE: f64 = 1.6384;

// =============================================================================
// Reply parsing
// =============================================================================

/// A parsed `@` reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Device address that answered
    pub device: u8,
    /// Axis number (0 for device-scope replies)
    pub axis: u8,
    /// `OK` (true) or `RJ` (false)
    pub accepted: bool,
    /// `BUSY` (true) or `IDLE` (false)
    pub busy: bool,
    /// Warning flag, `--` when clear
    pub warning: String,
    /// Reply data, `0` when there is none
    pub data: String,
}

impl Reply {
    /// Whether the device raised a warning flag.
    pub fn has_warning(&self) -> bool {
        self.warning != "--"
    }

    /// Reply data as an integer.
    pub fn data_as_i64(&self) -> AppResult<i64> {
        self.data.trim().parse::<i64>().map_err(|_| {
            ControlError::DeviceFault(format!("expected numeric reply data, got '{}'", self.data))
        })
    }
}

/// Parse one reply line.
///
/// Returns `None` for lines that are not replies (`#` info and `!` alert messages).
pub fn parse_reply(line: &str) -> Option<AppResult<Reply>> {
    let line = line.trim();
    let body = line.strip_prefix('@')?;

    // Drop an optional ":checksum" suffix
    let body = body.split(':').next().unwrap_or(body);
    let malformed = || ControlError::DeviceFault(format!("malformed reply '{}'", line));

    Some(parse_fields(body).ok_or_else(malformed))
}

fn parse_fields(body: &str) -> Option<Reply> {
    let mut fields = body.split_whitespace();
    let device = fields.next()?.parse::<u8>().ok()?;
    let axis = fields.next()?.parse::<u8>().ok()?;
    let accepted = match fields.next()? {
        "OK" => true,
        "RJ" => false,
        _ => return None,
    };
    let busy = match fields.next()? {
        "BUSY" => true,
        "IDLE" => false,
        _ => return None,
    };
    let warning = fields.next()?.to_string();
    let data = fields.collect::<Vec<_>>().join(" ");
    Some(Reply {
        device,
        axis,
        accepted,
        busy,
        warning,
        data,
    })
}

// =============================================================================
// Unit conversion
// =============================================================================

/// Converts between mm-based units and device microsteps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConversion {
    microstep_mm: f64,
}

impl UnitConversion {
    /// Conversion for a given microstep size in micrometres.
    pub fn from_microstep_um(microstep_um: f64) -> Self {
        Self {
            microstep_mm: microstep_um / 1000.0,
        }
    }

    /// mm → microsteps (rounded).
    pub fn position_to_native(&self, mm: f64) -> i64 {
        (mm / self.microstep_mm).round() as i64
    }

    /// microsteps → mm.
    pub fn position_from_native(&self, steps: i64) -> f64 {
        steps as f64 * self.microstep_mm
    }

    /// mm/s → native velocity (at least 1).
    pub fn velocity_to_native(&self, mm_per_s: f64) -> i64 {
        (mm_per_s / self.microstep_mm * VELOCITY_SCALE)
            .round()
            .max(1.0) as i64
    }
}

// =============================================================================
// ZaberConnector
// =============================================================================

/// Opens Zaber ASCII links and binds to the configured axis of the first device.
#[derive(Debug, Clone)]
pub struct ZaberConnector {
    config: AxisConfig,
}

impl ZaberConnector {
    /// Create a connector from the axis configuration.
    pub fn new(config: &AxisConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Run device detection on an already-open port.
    ///
    /// Used by `connect` and by tests that supply an in-memory stream.
    pub async fn connect_with_port(
        &self,
        port_name: &str,
        port: DynSerial,
    ) -> AppResult<ZaberConnection> {
        let shared = wrap_shared(port);
        let devices = detect_devices(&shared, self.config.detect_window()).await?;

        let Some(&device) = devices.first() else {
            warn!(port = port_name, "No Zaber devices answered detection");
            return Err(ControlError::NoDeviceDetected {
                port: port_name.to_string(),
            });
        };

        info!(
            port = port_name,
            device,
            axis = self.config.axis_number,
            detected = devices.len(),
            "Connected to motion device"
        );

        Ok(ZaberConnection {
            port_name: port_name.to_string(),
            axis: ZaberAxis {
                port: shared,
                device,
                axis: self.config.axis_number,
                timeout: self.config.command_timeout(),
                units: UnitConversion::from_microstep_um(self.config.microstep_size_um),
            },
        })
    }
}

#[async_trait]
impl AxisConnector for ZaberConnector {
    async fn connect(&self, port_name: &str) -> AppResult<Box<dyn AxisConnection>> {
        let stream = open_serial_async(port_name, self.config.baud_rate, "motion controller").await?;
        let connection = self.connect_with_port(port_name, Box::new(stream)).await?;
        Ok(Box::new(connection))
    }
}

/// Broadcast an empty command and collect the addresses that answer.
async fn detect_devices(port: &SharedPort, window: Duration) -> AppResult<Vec<u8>> {
    let mut guard = port.lock().await;

    let stale = drain_serial_buffer(guard.get_mut(), 20).await;
    if stale > 0 {
        debug!(bytes = stale, "Discarded stale bytes before detection");
    }

    let writer = guard.get_mut();
    writer.write_all(b"/\n").await?;
    writer.flush().await?;

    let deadline = tokio::time::Instant::now() + window;
    let mut devices = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        let mut line = String::new();
        match tokio::time::timeout(remaining, guard.read_line(&mut line)).await {
            Err(_) | Ok(Ok(0)) => break,
            Ok(Err(e)) => return Err(ControlError::Io(e)),
            Ok(Ok(_)) => match parse_reply(&line) {
                Some(Ok(reply)) => {
                    if !devices.contains(&reply.device) {
                        devices.push(reply.device);
                    }
                }
                Some(Err(e)) => debug!(error = %e, "Ignoring reply during detection"),
                None => {}
            },
        }
    }

    devices.sort_unstable();
    Ok(devices)
}

// =============================================================================
// ZaberConnection / ZaberAxis
// =============================================================================

/// An open Zaber link bound to one axis.
pub struct ZaberConnection {
    port_name: String,
    axis: ZaberAxis,
}

#[async_trait]
impl AxisConnection for ZaberConnection {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn axis(&self) -> AxisHandle<'_> {
        &self.axis
    }

    async fn disconnect(self: Box<Self>) -> AppResult<()> {
        let ZaberConnection { port_name, axis } = *self;
        let flushed = axis.port.lock().await.get_mut().flush().await;
        drop(axis);
        debug!(port = %port_name, "Motion device port released");
        flushed.map_err(ControlError::Io)
    }
}

/// One axis of a detected Zaber device.
pub struct ZaberAxis {
    port: SharedPort,
    device: u8,
    axis: u8,
    timeout: Duration,
    units: UnitConversion,
}

impl ZaberAxis {
    /// Device address.
    pub fn device(&self) -> u8 {
        self.device
    }

    /// Axis number.
    pub fn axis_number(&self) -> u8 {
        self.axis
    }

    /// Send a command and wait for this axis' reply.
    async fn command(&self, command: &str) -> AppResult<Reply> {
        let mut port = self.port.lock().await;

        let line = if command.is_empty() {
            format!("/{} {}\n", self.device, self.axis)
        } else {
            format!("/{} {} {}\n", self.device, self.axis, command)
        };
        let writer = port.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let mut response = String::new();
            let read = tokio::time::timeout(remaining, port.read_line(&mut response))
                .await
                .map_err(|_| {
                    ControlError::DeviceFault(format!(
                        "no reply to '{}' within {:?}",
                        line.trim(),
                        self.timeout
                    ))
                })??;

            if read == 0 {
                return Err(ControlError::SerialUnexpectedEof);
            }

            let reply = match parse_reply(&response) {
                Some(reply) => reply?,
                None => continue,
            };
            if reply.device != self.device {
                continue;
            }

            if !reply.accepted {
                return Err(ControlError::DeviceFault(format!(
                    "command '{}' rejected: {}",
                    line.trim(),
                    reply.data
                )));
            }
            if reply.has_warning() {
                warn!(device = self.device, flag = %reply.warning, "Device warning flag set");
            }
            return Ok(reply);
        }
    }

    #[cfg(test)]
    pub(crate) fn with_test_port(port: SharedPort, device: u8, axis: u8) -> Self {
        Self {
            port,
            device,
            axis,
            timeout: Duration::from_millis(500),
            units: UnitConversion::from_microstep_um(0.1),
        }
    }
}

#[async_trait]
impl Axis for ZaberAxis {
    #[instrument(skip(self), fields(device = self.device, axis = self.axis), err)]
    async fn get_position(&self) -> AppResult<f64> {
        let reply = self.command("get pos").await?;
        Ok(self.units.position_from_native(reply.data_as_i64()?))
    }

    #[instrument(skip(self), fields(device = self.device, axis = self.axis), err)]
    async fn set_max_speed(&self, speed_mm_s: f64) -> AppResult<()> {
        let native = self.units.velocity_to_native(speed_mm_s);
        self.command(&format!("set maxspeed {}", native)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(device = self.device, axis = self.axis), err)]
    async fn move_absolute(&self, position_mm: f64) -> AppResult<()> {
        let native = self.units.position_to_native(position_mm);
        self.command(&format!("move abs {}", native)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(device = self.device, axis = self.axis), err)]
    async fn move_relative(&self, delta_mm: f64) -> AppResult<()> {
        let native = self.units.position_to_native(delta_mm);
        self.command(&format!("move rel {}", native)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(device = self.device, axis = self.axis), err)]
    async fn move_min(&self) -> AppResult<()> {
        self.command("move min").await?;
        Ok(())
    }

    #[instrument(skip(self), fields(device = self.device, axis = self.axis), err)]
    async fn move_max(&self) -> AppResult<()> {
        self.command("move max").await?;
        Ok(())
    }

    async fn is_busy(&self) -> AppResult<bool> {
        Ok(self.command("").await?.busy)
    }
}
