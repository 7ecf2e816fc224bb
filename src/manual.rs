//! Manual command dispatch.
//!
//! Every manual operation is a scoped session of its own: connect, issue one
//! [`MotionCommand`], wait for the axis to go idle, disconnect. Requests are
//! rejected before any I/O while automatic control is active.

use crate::error::{AppResult, ControlError};
use crate::hardware::{wait_until_idle, AxisConnector, MotionCommand, MoveWait};
use crate::session::SharedSession;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Validates and forwards one-shot commands to the axis.
pub struct ManualDispatcher {
    session: SharedSession,
    connector: Arc<dyn AxisConnector>,
    wait: MoveWait,
}

impl ManualDispatcher {
    /// Create a dispatcher sharing `session` with the control loop.
    pub fn new(session: SharedSession, connector: Arc<dyn AxisConnector>, wait: MoveWait) -> Self {
        Self {
            session,
            connector,
            wait,
        }
    }

    /// Move back to the home position recorded by the last automatic session.
    pub async fn return_home(&self, port_name: &str) -> AppResult<()> {
        let home = {
            let state = self.session.read();
            state
                .ensure_manual_allowed()
                .and_then(|()| state.home_for_return())
        };
        let home = home.map_err(|err| rejected(err, "return home"))?;

        self.execute(port_name, MotionCommand::MoveAbsolute(home))
            .await
    }

    /// Drive to the minimum limit.
    pub async fn move_to_min(&self, port_name: &str) -> AppResult<()> {
        self.execute(port_name, MotionCommand::MoveToMin).await
    }

    /// Drive to the maximum limit.
    pub async fn move_to_max(&self, port_name: &str) -> AppResult<()> {
        self.execute(port_name, MotionCommand::MoveToMax).await
    }

    /// Move by a signed distance in mm.
    pub async fn move_relative(&self, port_name: &str, distance_mm: f64) -> AppResult<()> {
        if !distance_mm.is_finite() {
            return Err(ControlError::InvalidDistance(distance_mm));
        }
        self.execute(port_name, MotionCommand::MoveRelative(distance_mm))
            .await
    }

    /// Run `command` in its own connection scope and wait for it to finish.
    #[instrument(skip(self, command), fields(command = %command), err)]
    pub async fn execute(&self, port_name: &str, command: MotionCommand) -> AppResult<()> {
        let gate = self.session.read().ensure_manual_allowed();
        gate.map_err(|err| rejected(err, "manual command"))?;

        let connection = self.connector.connect(port_name).await?;
        info!(port = port_name, "Connected to axis");

        let result = async {
            let axis = connection.axis();
            command.issue(axis).await?;
            if command.starts_motion() {
                wait_until_idle(axis, self.wait).await?;
            }
            Ok::<(), ControlError>(())
        }
        .await;

        let closed = connection.disconnect().await;
        match &closed {
            Ok(()) => info!(port = port_name, "Axis connection closed"),
            Err(err) => warn!(port = port_name, %err, "Failed to close axis connection"),
        }

        result?;
        closed
    }
}

fn rejected(err: ControlError, what: &str) -> ControlError {
    warn!(%err, "Rejected {}", what);
    err
}
