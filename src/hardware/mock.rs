//! Mock Hardware Implementations
//!
//! In-process stand-ins for both serial peripherals, used by tests and by the
//! `--simulate` CLI flag.
//!
//! # Available Mocks
//!
//! - `MockSensorOpener` / `MockSensorLink` - scripted (or generated) sensor lines
//! - `MockAxisConnector` / `MockAxis` - idealized axis: moves complete instantly
//!   with no drift, every call is recorded
//! - `ConnectionCounter` - open/close bookkeeping shared by both
//!
//! Mocks share state through `Arc`s, so a test can keep a handle to the
//! connector or axis and inspect it after the controller has used it.

use crate::error::{AppResult, ControlError};
use crate::hardware::axis::{Axis, AxisConnection, AxisConnector, AxisHandle, MotionCommand};
use crate::sensor::{SensorLink, SensorOpener};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// ConnectionCounter
// =============================================================================

/// Counts successfully opened and closed connections.
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl ConnectionCounter {
    /// Connections opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Connections closed so far.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether every opened connection has been closed.
    pub fn is_balanced(&self) -> bool {
        self.opened() == self.closed()
    }

    fn record_open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// How a mock open should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    /// Port missing
    PortUnavailable,
    /// Port held by another process
    PermissionDenied,
    /// Port opened but no device answered (axis only)
    NoDeviceDetected,
}

impl OpenFailure {
    fn into_error(self, port: &str) -> ControlError {
        match self {
            OpenFailure::PortUnavailable => ControlError::PortUnavailable {
                port: port.to_string(),
                reason: "mock port not present".to_string(),
            },
            OpenFailure::PermissionDenied => ControlError::PermissionDenied {
                port: port.to_string(),
            },
            OpenFailure::NoDeviceDetected => ControlError::NoDeviceDetected {
                port: port.to_string(),
            },
        }
    }
}

// =============================================================================
// MockSensor
// =============================================================================

/// One scripted sensor event.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    /// A complete line (without terminator)
    Line(String),
    /// A poll that finds nothing ready
    Idle,
    /// The link drops
    Disconnect,
}

/// Triangle wave used by `--simulate`.
#[derive(Debug, Clone, Copy)]
struct Waveform {
    low: f64,
    high: f64,
    step: f64,
    value: f64,
    rising: bool,
}

impl Waveform {
    fn next_value(&mut self) -> f64 {
        let current = self.value;
        if self.rising {
            self.value += self.step;
            if self.value >= self.high {
                self.value = self.high;
                self.rising = false;
            }
        } else {
            self.value -= self.step;
            if self.value <= self.low {
                self.value = self.low;
                self.rising = true;
            }
        }
        current
    }
}

struct SensorScript {
    events: VecDeque<SensorEvent>,
    waveform: Option<Waveform>,
}

/// Opens mock sensor links that replay a shared script.
#[derive(Clone)]
pub struct MockSensorOpener {
    script: Arc<Mutex<SensorScript>>,
    counter: Arc<ConnectionCounter>,
    failure: Arc<Mutex<Option<OpenFailure>>>,
    idle_delay: Duration,
}

impl MockSensorOpener {
    /// Create an opener with an empty script.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(SensorScript {
                events: VecDeque::new(),
                waveform: None,
            })),
            counter: Arc::new(ConnectionCounter::default()),
            failure: Arc::new(Mutex::new(None)),
            idle_delay: Duration::from_millis(1),
        }
    }

    /// Create an opener that replays `lines` in order.
    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let opener = Self::new();
        for line in lines {
            opener.push_line(line);
        }
        opener
    }

    /// Create an opener producing a triangle wave between `low` and `high` volts,
    /// one sample every `period`.
    pub fn triangle_wave(low: f64, high: f64, step: f64, period: Duration) -> Self {
        let mut opener = Self::new();
        opener.script.lock().waveform = Some(Waveform {
            low,
            high,
            step: step.abs().max(f64::EPSILON),
            value: high,
            rising: false,
        });
        opener.idle_delay = period;
        opener
    }

    /// Append a line to the script.
    pub fn push_line(&self, line: impl Into<String>) {
        self.push_event(SensorEvent::Line(line.into()));
    }

    /// Append an arbitrary event to the script.
    pub fn push_event(&self, event: SensorEvent) {
        self.script.lock().events.push_back(event);
    }

    /// Number of scripted events not yet consumed.
    pub fn remaining(&self) -> usize {
        self.script.lock().events.len()
    }

    /// Make subsequent opens fail.
    pub fn fail_open(&self, failure: OpenFailure) {
        *self.failure.lock() = Some(failure);
    }

    /// Connection bookkeeping.
    pub fn counter(&self) -> Arc<ConnectionCounter> {
        Arc::clone(&self.counter)
    }
}

impl Default for MockSensorOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorOpener for MockSensorOpener {
    async fn open(&self, port_name: &str) -> AppResult<Box<dyn SensorLink>> {
        if let Some(failure) = *self.failure.lock() {
            return Err(failure.into_error(port_name));
        }
        self.counter.record_open();
        Ok(Box::new(MockSensorLink {
            script: Arc::clone(&self.script),
            counter: Arc::clone(&self.counter),
            idle_delay: self.idle_delay,
        }))
    }
}

/// Link handed out by [`MockSensorOpener`].
pub struct MockSensorLink {
    script: Arc<Mutex<SensorScript>>,
    counter: Arc<ConnectionCounter>,
    idle_delay: Duration,
}

#[async_trait]
impl SensorLink for MockSensorLink {
    async fn try_read_line(&mut self) -> AppResult<Option<String>> {
        let event = {
            let mut script = self.script.lock();
            match script.events.pop_front() {
                Some(event) => Some(event),
                None => script
                    .waveform
                    .as_mut()
                    .map(|wave| SensorEvent::Line(format!("{:.3}", wave.next_value()))),
            }
        };

        match event {
            Some(SensorEvent::Line(line)) => {
                if self.script.lock().waveform.is_some() {
                    tokio::time::sleep(self.idle_delay).await;
                }
                Ok(Some(line))
            }
            Some(SensorEvent::Disconnect) => Err(ControlError::SerialUnexpectedEof),
            Some(SensorEvent::Idle) | None => {
                tokio::time::sleep(self.idle_delay).await;
                Ok(None)
            }
        }
    }

    async fn close(self: Box<Self>) -> AppResult<()> {
        self.counter.record_close();
        Ok(())
    }
}

// =============================================================================
// MockAxis
// =============================================================================

/// A recorded driver call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisCall {
    /// `get_position`
    GetPosition,
    /// `is_busy`
    IsBusy,
    /// Any command from the shared vocabulary
    Command(MotionCommand),
}

#[derive(Debug)]
struct MockAxisState {
    position: f64,
    min_limit: f64,
    max_limit: f64,
    max_speed: Option<f64>,
    busy_polls_per_move: usize,
    busy_remaining: usize,
    stalled: bool,
    pending_fault: Option<String>,
    calls: Vec<AxisCall>,
}

/// Idealized single axis. Clones share state.
#[derive(Debug, Clone)]
pub struct MockAxis {
    state: Arc<Mutex<MockAxisState>>,
}

impl MockAxis {
    /// Axis at 0 mm with travel limits [0, 50] mm.
    pub fn new() -> Self {
        Self::with_position(0.0)
    }

    /// Axis at `position` mm with travel limits [0, 50] mm.
    pub fn with_position(position: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockAxisState {
                position,
                min_limit: 0.0,
                max_limit: 50.0,
                max_speed: None,
                busy_polls_per_move: 0,
                busy_remaining: 0,
                stalled: false,
                pending_fault: None,
                calls: Vec::new(),
            })),
        }
    }

    /// Set the travel limits.
    pub fn with_limits(self, min_limit: f64, max_limit: f64) -> Self {
        {
            let mut state = self.state.lock();
            state.min_limit = min_limit;
            state.max_limit = max_limit;
        }
        self
    }

    /// Report busy for `polls` polls after every move.
    pub fn with_busy_polls(self, polls: usize) -> Self {
        self.state.lock().busy_polls_per_move = polls;
        self
    }

    /// Never report idle after a move.
    pub fn stalled(self) -> Self {
        self.state.lock().stalled = true;
        self
    }

    /// Make the next driver call fail with a device fault.
    pub fn inject_fault(&self, message: impl Into<String>) {
        self.state.lock().pending_fault = Some(message.into());
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<AxisCall> {
        self.state.lock().calls.clone()
    }

    /// Only the commands made so far.
    pub fn commands(&self) -> Vec<MotionCommand> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                AxisCall::Command(command) => Some(*command),
                _ => None,
            })
            .collect()
    }

    /// Number of times `command` was issued.
    pub fn count(&self, command: MotionCommand) -> usize {
        self.commands().iter().filter(|c| **c == command).count()
    }

    /// Last speed set, if any.
    pub fn max_speed(&self) -> Option<f64> {
        self.state.lock().max_speed
    }

    /// Current position without recording a call.
    pub fn peek_position(&self) -> f64 {
        self.state.lock().position
    }

    fn record(&self, call: AxisCall) -> AppResult<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        match state.pending_fault.take() {
            Some(message) => Err(ControlError::DeviceFault(message)),
            None => Ok(()),
        }
    }

    fn move_to(&self, target: f64) {
        let mut state = self.state.lock();
        state.position = target.clamp(state.min_limit, state.max_limit);
        state.busy_remaining = state.busy_polls_per_move;
    }
}

impl Default for MockAxis {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Axis for MockAxis {
    async fn get_position(&self) -> AppResult<f64> {
        self.record(AxisCall::GetPosition)?;
        Ok(self.peek_position())
    }

    async fn set_max_speed(&self, speed_mm_s: f64) -> AppResult<()> {
        self.record(AxisCall::Command(MotionCommand::SetSpeed(speed_mm_s)))?;
        self.state.lock().max_speed = Some(speed_mm_s);
        Ok(())
    }

    async fn move_absolute(&self, position_mm: f64) -> AppResult<()> {
        self.record(AxisCall::Command(MotionCommand::MoveAbsolute(position_mm)))?;
        self.move_to(position_mm);
        Ok(())
    }

    async fn move_relative(&self, delta_mm: f64) -> AppResult<()> {
        self.record(AxisCall::Command(MotionCommand::MoveRelative(delta_mm)))?;
        let target = self.peek_position() + delta_mm;
        self.move_to(target);
        Ok(())
    }

    async fn move_min(&self) -> AppResult<()> {
        self.record(AxisCall::Command(MotionCommand::MoveToMin))?;
        let target = self.state.lock().min_limit;
        self.move_to(target);
        Ok(())
    }

    async fn move_max(&self) -> AppResult<()> {
        self.record(AxisCall::Command(MotionCommand::MoveToMax))?;
        let target = self.state.lock().max_limit;
        self.move_to(target);
        Ok(())
    }

    async fn is_busy(&self) -> AppResult<bool> {
        self.record(AxisCall::IsBusy)?;
        let mut state = self.state.lock();
        if state.stalled {
            return Ok(true);
        }
        if state.busy_remaining > 0 {
            state.busy_remaining -= 1;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Hands out connections to a shared [`MockAxis`].
#[derive(Clone)]
pub struct MockAxisConnector {
    axis: MockAxis,
    counter: Arc<ConnectionCounter>,
    failure: Arc<Mutex<Option<OpenFailure>>>,
    close_failure: Arc<Mutex<Option<String>>>,
}

impl MockAxisConnector {
    /// Connector for `axis`.
    pub fn new(axis: MockAxis) -> Self {
        Self {
            axis,
            counter: Arc::new(ConnectionCounter::default()),
            failure: Arc::new(Mutex::new(None)),
            close_failure: Arc::new(Mutex::new(None)),
        }
    }

    /// The shared axis.
    pub fn axis(&self) -> &MockAxis {
        &self.axis
    }

    /// Make subsequent connects fail.
    pub fn fail_connect(&self, failure: OpenFailure) {
        *self.failure.lock() = Some(failure);
    }

    /// Let connects succeed again.
    pub fn clear_failure(&self) {
        *self.failure.lock() = None;
    }

    /// Make the next disconnect report a device fault. The port is still
    /// released and counted as closed.
    pub fn fail_disconnect(&self, reason: impl Into<String>) {
        *self.close_failure.lock() = Some(reason.into());
    }

    /// Connection bookkeeping.
    pub fn counter(&self) -> Arc<ConnectionCounter> {
        Arc::clone(&self.counter)
    }
}

#[async_trait]
impl AxisConnector for MockAxisConnector {
    async fn connect(&self, port_name: &str) -> AppResult<Box<dyn AxisConnection>> {
        if let Some(failure) = *self.failure.lock() {
            return Err(failure.into_error(port_name));
        }
        self.counter.record_open();
        Ok(Box::new(MockAxisConnection {
            port_name: port_name.to_string(),
            axis: self.axis.clone(),
            counter: Arc::clone(&self.counter),
            close_failure: Arc::clone(&self.close_failure),
        }))
    }
}

struct MockAxisConnection {
    port_name: String,
    axis: MockAxis,
    counter: Arc<ConnectionCounter>,
    close_failure: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl AxisConnection for MockAxisConnection {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn axis(&self) -> AxisHandle<'_> {
        &self.axis
    }

    async fn disconnect(self: Box<Self>) -> AppResult<()> {
        self.counter.record_close();
        match self.close_failure.lock().take() {
            Some(reason) => Err(ControlError::DeviceFault(reason)),
            None => Ok(()),
        }
    }
}
