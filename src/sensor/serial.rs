//! Serial implementation of the sensor transport.

use super::{SensorLink, SensorOpener};
use crate::config::SensorConfig;
use crate::error::{AppResult, ControlError};
use crate::serial::{open_serial_async, DynSerial};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, warn};

/// Opens sensor links on real serial ports.
#[derive(Debug, Clone)]
pub struct SerialSensorOpener {
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialSensorOpener {
    /// Create an opener from the sensor configuration.
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            read_timeout: config.read_timeout(),
        }
    }
}

#[async_trait]
impl SensorOpener for SerialSensorOpener {
    async fn open(&self, port_name: &str) -> AppResult<Box<dyn SensorLink>> {
        let stream = open_serial_async(port_name, self.baud_rate, "sensor").await?;
        debug!(port = port_name, baud = self.baud_rate, "Sensor port opened");
        Ok(Box::new(SerialSensorLink::new(
            port_name,
            Box::new(stream),
            self.read_timeout,
        )))
    }
}

/// Longest line kept while waiting for its newline. A voltage reading needs
/// a handful of bytes.
pub const MAX_LINE_BYTES: usize = 256;

/// Line reader over an open sensor port.
///
/// Bytes of an incomplete line survive a timed-out read in `pending`, so a
/// line split across polls is reassembled rather than lost. A line that grows
/// past [`MAX_LINE_BYTES`] is discarded up to and including its newline.
pub struct SerialSensorLink {
    port_name: String,
    reader: BufReader<DynSerial>,
    pending: Vec<u8>,
    overflowed: bool,
    read_timeout: Duration,
}

impl SerialSensorLink {
    /// Wrap an already-open port.
    pub fn new(port_name: impl Into<String>, port: DynSerial, read_timeout: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            reader: BufReader::new(port),
            pending: Vec::with_capacity(32),
            overflowed: false,
            read_timeout,
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.pending.clear();
        line
    }
}

#[async_trait]
impl SensorLink for SerialSensorLink {
    async fn try_read_line(&mut self) -> AppResult<Option<String>> {
        let limit = (MAX_LINE_BYTES - self.pending.len()) as u64;
        let read = tokio::time::timeout(
            self.read_timeout,
            (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.pending),
        )
        .await;

        match read {
            // Nothing complete yet; partial bytes stay in `pending`
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(ControlError::Io(e)),
            Ok(Ok(0)) => Err(ControlError::SerialUnexpectedEof),
            Ok(Ok(_)) if self.pending.ends_with(b"\n") && self.overflowed => {
                self.pending.clear();
                self.overflowed = false;
                debug!(port = %self.port_name, "Resynchronized after oversized line");
                Ok(None)
            }
            Ok(Ok(_)) if self.pending.ends_with(b"\n") => {
                let line = self.take_line();
                debug!(port = %self.port_name, line = %line, "Sensor line");
                Ok(Some(line))
            }
            Ok(Ok(_)) if self.pending.len() >= MAX_LINE_BYTES => {
                if !self.overflowed {
                    warn!(
                        port = %self.port_name,
                        limit = MAX_LINE_BYTES,
                        "Sensor line too long, discarding until next newline"
                    );
                }
                self.pending.clear();
                self.overflowed = true;
                Ok(None)
            }
            // Stream ended mid-line; the next read reports EOF
            Ok(Ok(_)) => Ok(None),
        }
    }

    async fn close(self: Box<Self>) -> AppResult<()> {
        let SerialSensorLink {
            port_name, reader, ..
        } = *self;
        drop(reader);
        debug!(port = %port_name, "Sensor port released");
        Ok(())
    }
}
