//! Automatic control loop.
//!
//! An [`AutoSession`] owns the sensor link and the axis connection for the
//! duration of one automatic session:
//!
//! ```text
//! Idle → Connecting → Running → Stopping → Idle
//!            │            │
//!            └──────┬─────┘
//!                Faulted → Idle
//! ```
//!
//! [`AutoSession::connect`] performs the Connecting phase and
//! [`AutoSession::run`] drives Running until the stop channel fires or a fault
//! occurs. Both connections are closed on every exit path.

use crate::config::ControlConfig;
use crate::error::{AppResult, ControlError};
use crate::hardware::{AxisConnection, AxisConnector, MotionCommand};
use crate::sensor::{parse_voltage_line, SensorLink, SensorOpener};
use crate::session::{ControlState, SharedSession};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

/// Parameters for one automatic session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    /// Samples strictly below this voltage trigger a move to minimum
    pub threshold: f64,
    /// Pause after a poll that found no line
    pub poll_interval: Duration,
    /// Speed applied before every triggered move (mm/s)
    pub speed_mm_s: f64,
}

impl LoopSettings {
    /// Settings from configuration with a caller-supplied speed.
    pub fn new(config: &ControlConfig, speed_mm_s: f64) -> Self {
        Self {
            threshold: config.voltage_threshold,
            poll_interval: config.poll_interval(),
            speed_mm_s,
        }
    }
}

/// What one handled sensor line amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was ready
    NoData,
    /// Line was not a voltage
    Dropped,
    /// Voltage recorded, at or above threshold
    Observed,
    /// Voltage below threshold, move to minimum issued
    Triggered,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    /// Lines parsed as voltages
    pub samples_seen: u64,
    /// Lines discarded as unparseable
    pub samples_dropped: u64,
    /// Moves to minimum issued
    pub triggers: u64,
    /// Report of the fault that ended the session
    pub fault: Option<String>,
}

enum Wake {
    Stop,
    Read(AppResult<Option<String>>),
}

/// Connections and counters of a running automatic session.
pub struct AutoSession {
    session: SharedSession,
    sensor: Box<dyn SensorLink>,
    axis: Box<dyn AxisConnection>,
    settings: LoopSettings,
    summary: SessionSummary,
}

impl AutoSession {
    /// Open both links, record the home position and enter `Running`.
    ///
    /// On failure the session passes through `Faulted` back to `Idle`, every
    /// link opened so far is closed, and the triggering error is returned.
    #[instrument(skip(session, sensors, axes), fields(speed = settings.speed_mm_s), err)]
    pub async fn connect(
        session: SharedSession,
        sensors: &dyn SensorOpener,
        axes: &dyn AxisConnector,
        sensor_port: &str,
        axis_port: &str,
        settings: LoopSettings,
    ) -> AppResult<Self> {
        session.write().begin()?;

        let sensor = match sensors.open(sensor_port).await {
            Ok(link) => link,
            Err(err) => return Err(fault_and_close(&session, err, None, None).await),
        };
        info!(port = sensor_port, "Connected to sensor");

        let axis = match axes.connect(axis_port).await {
            Ok(connection) => connection,
            Err(err) => return Err(fault_and_close(&session, err, Some(sensor), None).await),
        };
        info!(port = axis_port, "Connected to axis");

        let home = match axis.axis().get_position().await {
            Ok(position) => position,
            Err(err) => {
                return Err(fault_and_close(&session, err, Some(sensor), Some(axis)).await)
            }
        };

        {
            let mut state = session.write();
            state.record_home(home);
            state.transition(ControlState::Running);
        }

        Ok(Self {
            session,
            sensor,
            axis,
            settings,
            summary: SessionSummary::default(),
        })
    }

    /// Poll the sensor and apply the threshold policy until `stop` reads
    /// `true` (or its sender is dropped) or a fault occurs.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> SessionSummary {
        let fault = loop {
            if stop_requested(&stop) {
                break None;
            }

            let wake = tokio::select! {
                biased;
                changed = stop.changed() => match changed {
                    Ok(()) if !stop_requested(&stop) => continue,
                    _ => Wake::Stop,
                },
                read = self.sensor.try_read_line() => Wake::Read(read),
            };

            let outcome = match wake {
                Wake::Stop => break None,
                Wake::Read(Ok(Some(line))) => self.handle_line(&line).await,
                Wake::Read(Ok(None)) => Ok(TickOutcome::NoData),
                Wake::Read(Err(err)) => Err(err),
            };

            match outcome {
                Ok(TickOutcome::NoData) => tokio::time::sleep(self.settings.poll_interval).await,
                Ok(_) => {}
                Err(err) => break Some(err),
            }
        };

        self.shutdown(fault).await
    }

    async fn handle_line(&mut self, line: &str) -> AppResult<TickOutcome> {
        let sample = match parse_voltage_line(line) {
            Ok(sample) => sample,
            Err(err) => {
                debug!(%err, "Dropping sensor line");
                self.summary.samples_dropped += 1;
                return Ok(TickOutcome::Dropped);
            }
        };

        self.summary.samples_seen += 1;
        self.session.write().record_sample(sample);
        trace!(voltage = sample.value, "Voltage sample");

        if !sample.is_below(self.settings.threshold) {
            return Ok(TickOutcome::Observed);
        }

        info!(
            voltage = sample.value,
            threshold = self.settings.threshold,
            "Voltage below threshold, moving to minimum"
        );
        let axis = self.axis.axis();
        MotionCommand::SetSpeed(self.settings.speed_mm_s)
            .issue(axis)
            .await?;
        MotionCommand::MoveToMin.issue(axis).await?;
        self.summary.triggers += 1;

        Ok(TickOutcome::Triggered)
    }

    async fn shutdown(self, fault: Option<ControlError>) -> SessionSummary {
        let AutoSession {
            session,
            sensor,
            axis,
            mut summary,
            ..
        } = self;

        match fault {
            None => {
                session.write().transition(ControlState::Stopping);
                close_all(Some(sensor), Some(axis)).await;
                session.write().finish(None);
                info!(
                    samples = summary.samples_seen,
                    dropped = summary.samples_dropped,
                    triggers = summary.triggers,
                    "Automatic control stopped"
                );
            }
            Some(err) => {
                summary.fault = Some(err.to_string());
                fault_and_close(&session, err, Some(sensor), Some(axis)).await;
            }
        }

        summary
    }
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Faulted handling: report, close what is open, clear `running`.
async fn fault_and_close(
    session: &SharedSession,
    err: ControlError,
    sensor: Option<Box<dyn SensorLink>>,
    axis: Option<Box<dyn AxisConnection>>,
) -> ControlError {
    session.write().transition(ControlState::Faulted);
    error!(%err, "Automatic control faulted");
    close_all(sensor, axis).await;
    session.write().finish(Some(err.to_string()));
    err
}

/// Close both links, attempting each even if the other fails.
async fn close_all(sensor: Option<Box<dyn SensorLink>>, axis: Option<Box<dyn AxisConnection>>) {
    if let Some(axis) = axis {
        let port = axis.port_name().to_string();
        match axis.disconnect().await {
            Ok(()) => info!(port = %port, "Axis connection closed"),
            Err(err) => warn!(port = %port, %err, "Failed to close axis connection"),
        }
    }

    if let Some(sensor) = sensor {
        match sensor.close().await {
            Ok(()) => info!("Sensor connection closed"),
            Err(err) => warn!(%err, "Failed to close sensor connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Precondition;
    use crate::hardware::mock::{
        MockAxis, MockAxisConnector, MockSensorOpener, OpenFailure, SensorEvent,
    };
    use crate::session::SessionState;
    use tracing_test::traced_test;

    fn settings() -> LoopSettings {
        LoopSettings {
            threshold: 4.0,
            poll_interval: Duration::from_millis(1),
            speed_mm_s: 25.0,
        }
    }

    #[tokio::test]
    async fn test_connect_records_home_and_runs() {
        let session = SessionState::shared();
        let sensors = MockSensorOpener::new();
        let axes = MockAxisConnector::new(MockAxis::with_position(17.5));

        let auto = AutoSession::connect(
            session.clone(),
            &sensors,
            &axes,
            "/dev/ttyACM0",
            "/dev/ttyUSB0",
            settings(),
        )
        .await
        .unwrap();

        assert_eq!(session.read().state(), ControlState::Running);
        assert_eq!(session.read().home_position(), Some(17.5));

        let (stop_tx, stop_rx) = watch::channel(true);
        let summary = auto.run(stop_rx).await;
        drop(stop_tx);

        assert_eq!(summary, SessionSummary::default());
        assert!(!session.read().is_running());
        assert!(sensors.counter().is_balanced());
        assert!(axes.counter().is_balanced());
    }

    #[tokio::test]
    async fn test_level_trigger_then_disconnect_faults() {
        let session = SessionState::shared();
        let sensors = MockSensorOpener::with_lines(["4.5", "3.9", "N/A", "3.8", "4.1"]);
        sensors.push_event(SensorEvent::Disconnect);
        let axes = MockAxisConnector::new(MockAxis::with_position(20.0));

        let auto = AutoSession::connect(session.clone(), &sensors, &axes, "s", "a", settings())
            .await
            .unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let summary = auto.run(stop_rx).await;

        assert_eq!(summary.samples_seen, 4);
        assert_eq!(summary.samples_dropped, 1);
        assert_eq!(summary.triggers, 2);
        assert!(summary.fault.is_some());

        let axis = axes.axis();
        assert_eq!(axis.count(MotionCommand::MoveToMin), 2);
        assert_eq!(axis.count(MotionCommand::SetSpeed(25.0)), 2);
        assert_eq!(axis.max_speed(), Some(25.0));

        let state = session.read();
        assert_eq!(state.state(), ControlState::Idle);
        assert!(!state.is_running());
        assert_eq!(state.last_voltage(), Some(4.1));
        assert!(state.last_fault().is_some());
        assert!(sensors.counter().is_balanced());
        assert!(axes.counter().is_balanced());
    }

    #[tokio::test]
    async fn test_axis_connect_failure_closes_sensor() {
        let session = SessionState::shared();
        let sensors = MockSensorOpener::new();
        let axes = MockAxisConnector::new(MockAxis::new());
        axes.fail_connect(OpenFailure::NoDeviceDetected);

        let result =
            AutoSession::connect(session.clone(), &sensors, &axes, "s", "COM7", settings()).await;

        assert!(matches!(result, Err(ControlError::NoDeviceDetected { port }) if port == "COM7"));
        assert_eq!(sensors.counter().opened(), 1);
        assert!(sensors.counter().is_balanced());
        assert!(!session.read().is_running());
        assert_eq!(session.read().state(), ControlState::Idle);
    }

    #[tokio::test]
    async fn test_home_query_failure_closes_both() {
        let session = SessionState::shared();
        let sensors = MockSensorOpener::new();
        let axes = MockAxisConnector::new(MockAxis::new());
        axes.axis().inject_fault("no reply");

        let result =
            AutoSession::connect(session.clone(), &sensors, &axes, "s", "a", settings()).await;

        assert!(matches!(result, Err(ControlError::DeviceFault(_))));
        assert!(sensors.counter().is_balanced());
        assert!(axes.counter().is_balanced());
        assert_eq!(session.read().home_position(), None);
    }

    #[tokio::test]
    async fn test_second_connect_rejected_while_running() {
        let session = SessionState::shared();
        let sensors = MockSensorOpener::new();
        let axes = MockAxisConnector::new(MockAxis::new());

        let first = AutoSession::connect(session.clone(), &sensors, &axes, "s", "a", settings())
            .await
            .unwrap();
        let second =
            AutoSession::connect(session.clone(), &sensors, &axes, "s", "a", settings()).await;

        assert!(matches!(
            second,
            Err(ControlError::Precondition(Precondition::AlreadyRunning))
        ));
        assert_eq!(sensors.counter().opened(), 1);

        let (_stop_tx, stop_rx) = watch::channel(true);
        first.run(stop_rx).await;
        assert!(sensors.counter().is_balanced());
    }

    #[tokio::test]
    async fn test_stop_signal_ends_idle_loop() {
        let session = SessionState::shared();
        let sensors = MockSensorOpener::new();
        sensors.push_event(SensorEvent::Idle);
        let axes = MockAxisConnector::new(MockAxis::new());

        let auto = AutoSession::connect(session.clone(), &sensors, &axes, "s", "a", settings())
            .await
            .unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(auto.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(summary.fault.is_none());
        assert!(axes.axis().commands().is_empty());
        assert!(axes.counter().is_balanced());
        assert!(!session.read().is_running());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_axis_close_failure_still_closes_sensor() {
        let session = SessionState::shared();
        let sensors = MockSensorOpener::new();
        let axes = MockAxisConnector::new(MockAxis::new());
        axes.fail_disconnect("port vanished");

        let auto = AutoSession::connect(session.clone(), &sensors, &axes, "s", "a", settings())
            .await
            .unwrap();
        let (_stop_tx, stop_rx) = watch::channel(true);
        let summary = auto.run(stop_rx).await;

        assert!(summary.fault.is_none());
        assert!(logs_contain("Failed to close axis connection"));
        assert!(logs_contain("Sensor connection closed"));
        assert!(sensors.counter().is_balanced());
        assert!(axes.counter().is_balanced());

        let state = session.read();
        assert!(!state.is_running());
        assert_eq!(state.state(), ControlState::Idle);
        assert_eq!(state.last_fault(), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connection_events_are_logged() {
        let session = SessionState::shared();
        let sensors = MockSensorOpener::new();
        sensors.push_event(SensorEvent::Disconnect);
        let axes = MockAxisConnector::new(MockAxis::new());

        let auto = AutoSession::connect(session, &sensors, &axes, "COM5", "COM6", settings())
            .await
            .unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        auto.run(stop_rx).await;

        assert!(logs_contain("Connected to sensor"));
        assert!(logs_contain("Connected to axis"));
        assert!(logs_contain("Automatic control faulted"));
        assert!(logs_contain("Axis connection closed"));
        assert!(logs_contain("Sensor connection closed"));
    }
}
