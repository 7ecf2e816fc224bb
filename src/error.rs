//! Error types for the stage control application.
//!
//! `ControlError` is the single error type shared by the serial transport, the
//! axis driver adapter, the control loop and the manual dispatcher. It is built
//! with `thiserror` so lower-level failures convert with `?`.
//!
//! ## Error Hierarchy
//!
//! - **Connection errors** (`PortUnavailable`, `PermissionDenied`, `NoDeviceDetected`):
//!   raised while a connection scope is being opened. Reported once, never retried.
//! - **Faults** (`DeviceFault`, `SerialUnexpectedEof`, `Io`, `MoveTimeout`): raised after
//!   a connection was established. In automatic mode they end the session.
//! - **User-actionable conditions** (`Precondition`, `InvalidSpeed`, `InvalidDistance`,
//!   `Configuration`): rejected before any I/O happens.
//! - **`Parse`**: a sensor line that is not a number. The control loop drops these
//!   silently; the variant exists so the parser has something to return.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ControlError>;

/// Preconditions a host request can violate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// A manual command arrived while automatic control holds the axis.
    AutomaticModeActive,
    /// `return_home` was requested before any automatic session recorded a home.
    HomeNotRecorded,
    /// `start_auto` was requested while a session is already active.
    AlreadyRunning,
}

impl std::fmt::Display for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Precondition::AutomaticModeActive => {
                "automatic control is active; stop it before issuing manual commands"
            }
            Precondition::HomeNotRecorded => {
                "home position not set; start automatic control first"
            }
            Precondition::AlreadyRunning => "automatic control is already running",
        };
        f.write_str(message)
    }
}

/// Primary error type for stage control.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Serial port could not be opened (missing device, bad path, driver error).
    ///
    /// **Recovery Strategy**: Check the port name and cabling, then issue a fresh request.
    #[error("Port '{port}' is unavailable: {reason}")]
    PortUnavailable {
        /// Port name as given by the host.
        port: String,
        /// Underlying cause reported by the OS.
        reason: String,
    },

    /// Serial port exists but access was refused.
    ///
    /// Usually another process holds the port open.
    ///
    /// **Recovery Strategy**: Close the other application. Not retried automatically.
    #[error("Could not open port '{port}': access denied. The port might be in use by another application")]
    PermissionDenied {
        /// Port name as given by the host.
        port: String,
    },

    /// Axis controller link opened but device enumeration found nothing.
    #[error("No motion device detected on port '{port}'")]
    NoDeviceDetected {
        /// Port name as given by the host.
        port: String,
    },

    /// A driver call failed after the connection was established.
    ///
    /// **Error Type**: Fault. Ends an automatic session.
    #[error("Device fault: {0}")]
    DeviceFault(String),

    /// Sensor line could not be parsed as a voltage.
    ///
    /// Never surfaced to the user; the control loop drops the sample.
    #[error("Unparseable sensor line: {0:?}")]
    Parse(String),

    /// Request violates a session precondition. Performs no I/O.
    #[error("{0}")]
    Precondition(Precondition),

    /// Requested speed is outside the accepted range.
    #[error("Speed {0} mm/s is outside the allowed range [0.1, 700.0] mm/s")]
    InvalidSpeed(f64),

    /// Requested relative distance is not a finite number.
    #[error("Distance {0} mm is not a valid relative move")]
    InvalidDistance(f64),

    /// Waiting for a move to finish exceeded the configured bound.
    ///
    /// **Recovery Strategy**: Inspect the stage for a stall or obstruction.
    #[error("Axis still busy after {0:?}; giving up on move completion")]
    MoveTimeout(Duration),

    /// Configuration values parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure on an open link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial link reached end-of-file, usually an unplugged device.
    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,
}

impl ControlError {
    /// Whether the error is a user-actionable condition rather than a fault.
    ///
    /// User-actionable errors are reported at `warn` level and never touch
    /// hardware; everything else is a fault.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            ControlError::Precondition(_)
                | ControlError::InvalidSpeed(_)
                | ControlError::InvalidDistance(_)
                | ControlError::Configuration(_)
        )
    }
}

impl From<Precondition> for ControlError {
    fn from(precondition: Precondition) -> Self {
        ControlError::Precondition(precondition)
    }
}
