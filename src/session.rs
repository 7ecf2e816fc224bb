//! Session State
//!
//! Tracks whether automatic control is active, the recorded home position and
//! the latest voltage. The control loop, the manual dispatcher and the host
//! share one [`SharedSession`]; locks are held only for short, non-async
//! critical sections.

use crate::error::{AppResult, ControlError, Precondition};
use crate::sensor::VoltageSample;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared handle to the session state.
pub type SharedSession = Arc<RwLock<SessionState>>;

/// Control loop lifecycle.
///
/// `Idle → Connecting → Running → Stopping → Idle`, with `Faulted`
/// reachable from `Connecting` or `Running` and always returning to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlState {
    /// No connections held
    #[default]
    Idle,
    /// Opening the sensor and axis links
    Connecting,
    /// Polling the sensor and applying the threshold policy
    Running,
    /// Closing connections after a stop request
    Stopping,
    /// Reporting a fault and closing connections
    Faulted,
}

impl ControlState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: ControlState) -> bool {
        use ControlState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Running)
                | (Connecting, Faulted)
                | (Running, Stopping)
                | (Running, Faulted)
                | (Stopping, Idle)
                | (Faulted, Idle)
        )
    }

    /// Lowercase label for display.
    pub fn label(self) -> &'static str {
        match self {
            ControlState::Idle => "idle",
            ControlState::Connecting => "connecting",
            ControlState::Running => "running",
            ControlState::Stopping => "stopping",
            ControlState::Faulted => "faulted",
        }
    }
}

impl std::fmt::Display for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Process-wide session state.
#[derive(Debug, Default)]
pub struct SessionState {
    running: bool,
    state: ControlState,
    home_position: Option<f64>,
    home_locked: bool,
    latest_sample: Option<VoltageSample>,
    last_fault: Option<String>,
}

impl SessionState {
    /// Fresh state: not running, no home, no voltage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared handle around a fresh state.
    pub fn shared() -> SharedSession {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Whether automatic control is active.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControlState {
        self.state
    }

    /// Home position recorded by the most recent automatic session.
    pub fn home_position(&self) -> Option<f64> {
        self.home_position
    }

    /// Latest parsed voltage.
    pub fn last_voltage(&self) -> Option<f64> {
        self.latest_sample.map(|sample| sample.value)
    }

    /// Latest parsed sample.
    pub fn latest_sample(&self) -> Option<VoltageSample> {
        self.latest_sample
    }

    /// Report of the fault that ended the last session, if any.
    pub fn last_fault(&self) -> Option<&str> {
        self.last_fault.as_deref()
    }

    /// Start a new automatic session and enter `Connecting`.
    pub fn begin(&mut self) -> AppResult<()> {
        if self.running {
            return Err(Precondition::AlreadyRunning.into());
        }
        self.running = true;
        self.home_locked = false;
        self.last_fault = None;
        self.transition(ControlState::Connecting);
        Ok(())
    }

    /// Record the home position. Only the first call per session takes effect.
    pub fn record_home(&mut self, position: f64) -> bool {
        if self.home_locked {
            warn!(position, "Home position already recorded for this session");
            return false;
        }
        self.home_position = Some(position);
        self.home_locked = true;
        info!(position, "Home position recorded");
        true
    }

    /// Store a freshly parsed sample.
    pub fn record_sample(&mut self, sample: VoltageSample) {
        self.latest_sample = Some(sample);
    }

    /// Move to `next`, logging the transition.
    pub fn transition(&mut self, next: ControlState) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Unexpected control state transition");
        }
        info!(from = %self.state, to = %next, "Control state");
        self.state = next;
    }

    /// End the session: clear `running` and return to `Idle`.
    pub fn finish(&mut self, fault: Option<String>) {
        self.running = false;
        self.last_fault = fault;
        self.transition(ControlState::Idle);
    }

    /// Gate for manual commands.
    pub fn ensure_manual_allowed(&self) -> AppResult<()> {
        if self.running {
            return Err(ControlError::Precondition(Precondition::AutomaticModeActive));
        }
        Ok(())
    }

    /// Home target for `return_home`.
    pub fn home_for_return(&self) -> AppResult<f64> {
        self.home_position
            .ok_or(ControlError::Precondition(Precondition::HomeNotRecorded))
    }
}
