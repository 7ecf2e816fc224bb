//! Axis capability traits and the shared motion command vocabulary.
//!
//! # Contract
//! - Positions are in millimetres, speeds in millimetres per second
//! - Motion calls initiate a move and return once the device has accepted it;
//!   completion is observed with [`Axis::is_busy`]
//! - An [`AxisHandle`] borrows its [`AxisConnection`] and cannot outlive it
//! - [`AxisConnection::disconnect`] consumes the connection and must be called
//!   on every exit path of a connection scope

use crate::error::{AppResult, ControlError};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Capability: single-axis linear motion.
#[async_trait]
pub trait Axis: Send + Sync {
    /// Current position in mm.
    async fn get_position(&self) -> AppResult<f64>;

    /// Set the maximum speed used by subsequent moves (mm/s).
    async fn set_max_speed(&self, speed_mm_s: f64) -> AppResult<()>;

    /// Move to an absolute position (mm).
    async fn move_absolute(&self, position_mm: f64) -> AppResult<()>;

    /// Move by a signed distance (mm).
    async fn move_relative(&self, delta_mm: f64) -> AppResult<()>;

    /// Move towards the minimum travel limit.
    async fn move_min(&self) -> AppResult<()>;

    /// Move towards the maximum travel limit.
    async fn move_max(&self) -> AppResult<()>;

    /// Whether the axis is still executing a move.
    async fn is_busy(&self) -> AppResult<bool>;
}

/// Borrowed reference to the axis of an open connection.
pub type AxisHandle<'a> = &'a dyn Axis;

/// An open link to a detected motion device, bound to one axis.
#[async_trait]
pub trait AxisConnection: Send + Sync {
    /// Port the connection was opened on.
    fn port_name(&self) -> &str;

    /// The bound axis, valid for the lifetime of this connection.
    fn axis(&self) -> AxisHandle<'_>;

    /// Close the link.
    async fn disconnect(self: Box<Self>) -> AppResult<()>;
}

/// Opens axis connections by port name.
#[async_trait]
pub trait AxisConnector: Send + Sync {
    /// Open the port, detect devices and bind to the configured axis of the first one.
    ///
    /// # Errors
    /// - `PortUnavailable` / `PermissionDenied` if the port cannot be opened
    /// - `NoDeviceDetected` if enumeration finds nothing
    async fn connect(&self, port_name: &str) -> AppResult<Box<dyn AxisConnection>>;
}

/// The commands both automatic policy and manual dispatch send to an axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionCommand {
    /// Drive to the minimum limit.
    MoveToMin,
    /// Drive to the maximum limit.
    MoveToMax,
    /// Drive to an absolute position (mm).
    MoveAbsolute(f64),
    /// Drive by a signed distance (mm).
    MoveRelative(f64),
    /// Set the maximum speed (mm/s).
    SetSpeed(f64),
}

impl MotionCommand {
    /// Send this command to `axis`. Does not wait for motion to finish.
    pub async fn issue(&self, axis: AxisHandle<'_>) -> AppResult<()> {
        debug!(command = %self, "Issuing motion command");
        match *self {
            MotionCommand::MoveToMin => axis.move_min().await,
            MotionCommand::MoveToMax => axis.move_max().await,
            MotionCommand::MoveAbsolute(position) => axis.move_absolute(position).await,
            MotionCommand::MoveRelative(delta) => axis.move_relative(delta).await,
            MotionCommand::SetSpeed(speed) => axis.set_max_speed(speed).await,
        }
    }

    /// Whether the command starts a move (as opposed to changing a setting).
    pub fn starts_motion(&self) -> bool {
        !matches!(self, MotionCommand::SetSpeed(_))
    }
}

impl fmt::Display for MotionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionCommand::MoveToMin => write!(f, "move to min"),
            MotionCommand::MoveToMax => write!(f, "move to max"),
            MotionCommand::MoveAbsolute(position) => write!(f, "move to {:.4} mm", position),
            MotionCommand::MoveRelative(delta) => write!(f, "move by {:+.4} mm", delta),
            MotionCommand::SetSpeed(speed) => write!(f, "set speed {:.3} mm/s", speed),
        }
    }
}

/// Bounds for waiting on move completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveWait {
    /// Interval between `is_busy` polls
    pub poll_interval: Duration,
    /// Give up after this long
    pub max_wait: Duration,
}

impl Default for MoveWait {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(120),
        }
    }
}

/// Poll `is_busy` until the axis is idle.
///
/// # Errors
/// [`ControlError::MoveTimeout`] if the axis is still busy after `wait.max_wait`.
pub async fn wait_until_idle(axis: AxisHandle<'_>, wait: MoveWait) -> AppResult<()> {
    let start = tokio::time::Instant::now();

    loop {
        if !axis.is_busy().await? {
            return Ok(());
        }

        if start.elapsed() >= wait.max_wait {
            return Err(ControlError::MoveTimeout(wait.max_wait));
        }

        tokio::time::sleep(wait.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{AxisCall, MockAxis};

    #[tokio::test]
    async fn test_issue_dispatches_to_axis() {
        let axis = MockAxis::with_position(5.0);

        MotionCommand::SetSpeed(12.0).issue(&axis).await.unwrap();
        MotionCommand::MoveRelative(-2.0).issue(&axis).await.unwrap();

        assert_eq!(axis.get_position().await.unwrap(), 3.0);
        assert_eq!(
            axis.commands(),
            vec![MotionCommand::SetSpeed(12.0), MotionCommand::MoveRelative(-2.0)]
        );
    }

    #[tokio::test]
    async fn test_wait_until_idle_polls_until_done() {
        let axis = MockAxis::new().with_busy_polls(3);
        MotionCommand::MoveToMax.issue(&axis).await.unwrap();

        let wait = MoveWait {
            poll_interval: Duration::from_millis(1),
            max_wait: Duration::from_secs(5),
        };
        wait_until_idle(&axis, wait).await.unwrap();

        let polls = axis
            .calls()
            .iter()
            .filter(|call| matches!(call, AxisCall::IsBusy))
            .count();
        assert_eq!(polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_idle_times_out_on_stall() {
        let axis = MockAxis::new().stalled();
        MotionCommand::MoveToMin.issue(&axis).await.unwrap();

        let wait = MoveWait {
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(2),
        };
        let result = wait_until_idle(&axis, wait).await;

        assert!(matches!(result, Err(ControlError::MoveTimeout(d)) if d == Duration::from_secs(2)));
    }

    #[test]
    fn test_command_display() {
        assert_eq!(MotionCommand::MoveRelative(1.5).to_string(), "move by +1.5000 mm");
        assert!(!MotionCommand::SetSpeed(1.0).starts_motion());
        assert!(MotionCommand::MoveToMin.starts_motion());
    }
}
