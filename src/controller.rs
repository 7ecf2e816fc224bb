//! Host-facing operation surface.
//!
//! [`StageController`] is what a UI (or the CLI in `main.rs`) talks to. It
//! owns the shared session state, starts and stops the automatic loop task,
//! and routes manual commands through the [`ManualDispatcher`].

use crate::config::{validate_speed, StageConfig};
use crate::control_loop::{AutoSession, LoopSettings, SessionSummary};
use crate::error::AppResult;
use crate::hardware::{AxisConnector, MoveWait, ZaberConnector};
use crate::manual::ManualDispatcher;
use crate::sensor::{SensorOpener, SerialSensorOpener, VoltageSample};
use crate::session::{ControlState, SessionState, SharedSession};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct ActiveLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<SessionSummary>,
}

/// Entry point for every host operation.
///
/// Operations that touch a port take one shared lock, so `start_auto`,
/// `stop_auto` and the manual commands run one at a time even when called
/// concurrently. A manual command issued while `start_auto` is connecting
/// waits for it and is then rejected with `AutomaticModeActive`. The getters
/// only read the session and never wait.
pub struct StageController {
    config: StageConfig,
    session: SharedSession,
    sensors: Arc<dyn SensorOpener>,
    axes: Arc<dyn AxisConnector>,
    manual: ManualDispatcher,
    // Held for the whole of every port-touching operation
    active: Mutex<Option<ActiveLoop>>,
}

impl StageController {
    /// Controller over the given transports.
    pub fn new(
        config: StageConfig,
        sensors: Arc<dyn SensorOpener>,
        axes: Arc<dyn AxisConnector>,
    ) -> Self {
        let session = SessionState::shared();
        let wait = MoveWait {
            poll_interval: config.axis.busy_poll_interval(),
            max_wait: config.axis.max_move_wait(),
        };
        let manual = ManualDispatcher::new(session.clone(), Arc::clone(&axes), wait);

        Self {
            config,
            session,
            sensors,
            axes,
            manual,
            active: Mutex::new(None),
        }
    }

    /// Controller over real serial hardware.
    pub fn with_hardware(config: StageConfig) -> Self {
        let sensors = Arc::new(SerialSensorOpener::new(&config.sensor));
        let axes = Arc::new(ZaberConnector::new(&config.axis));
        Self::new(config, sensors, axes)
    }

    /// Start automatic control.
    ///
    /// Validates `speed_mm_s`, then connects both devices before returning;
    /// connection failures are returned here. The Running phase continues on a
    /// background task until [`stop_auto`](Self::stop_auto) or a fault.
    pub async fn start_auto(
        &self,
        sensor_port: &str,
        axis_port: &str,
        speed_mm_s: f64,
    ) -> AppResult<()> {
        let speed = validate_speed(speed_mm_s)?;

        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|run| run.handle.is_finished()) {
            if let Some(finished) = active.take() {
                Self::collect(finished).await;
            }
        }

        let settings = LoopSettings::new(&self.config.control, speed);
        let auto = AutoSession::connect(
            self.session.clone(),
            self.sensors.as_ref(),
            self.axes.as_ref(),
            sensor_port,
            axis_port,
            settings,
        )
        .await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(auto.run(stop_rx));
        *active = Some(ActiveLoop { stop_tx, handle });

        info!(sensor_port, axis_port, speed, "Automatic control started");
        Ok(())
    }

    /// Stop automatic control and wait for both connections to close.
    ///
    /// Idempotent: returns `None` when nothing was running.
    pub async fn stop_auto(&self) -> Option<SessionSummary> {
        let run = self.active.lock().await.take()?;
        // Receiver gone means the loop already ended on its own
        let _ = run.stop_tx.send(true);
        Self::collect(run).await
    }

    async fn collect(run: ActiveLoop) -> Option<SessionSummary> {
        match run.handle.await {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!(%err, "Control loop task ended abnormally");
                None
            }
        }
    }

    /// Move the axis back to the recorded home position.
    pub async fn return_home(&self, axis_port: &str) -> AppResult<()> {
        let _serialized = self.active.lock().await;
        self.manual.return_home(axis_port).await
    }

    /// Drive the axis to its minimum limit.
    pub async fn move_to_min(&self, axis_port: &str) -> AppResult<()> {
        let _serialized = self.active.lock().await;
        self.manual.move_to_min(axis_port).await
    }

    /// Drive the axis to its maximum limit.
    pub async fn move_to_max(&self, axis_port: &str) -> AppResult<()> {
        let _serialized = self.active.lock().await;
        self.manual.move_to_max(axis_port).await
    }

    /// Move the axis by a signed distance in mm.
    pub async fn move_relative(&self, axis_port: &str, distance_mm: f64) -> AppResult<()> {
        let _serialized = self.active.lock().await;
        self.manual.move_relative(axis_port, distance_mm).await
    }

    /// Latest voltage read by the automatic loop.
    pub fn current_voltage(&self) -> Option<f64> {
        self.session.read().last_voltage()
    }

    /// Latest sample with its timestamp.
    pub fn latest_sample(&self) -> Option<VoltageSample> {
        self.session.read().latest_sample()
    }

    /// Whether automatic control is active.
    pub fn is_running(&self) -> bool {
        self.session.read().is_running()
    }

    /// Current control loop state.
    pub fn state(&self) -> ControlState {
        self.session.read().state()
    }

    /// Home position recorded by the last automatic session.
    pub fn home_position(&self) -> Option<f64> {
        self.session.read().home_position()
    }

    /// Report of the fault that ended the last automatic session.
    pub fn last_fault(&self) -> Option<String> {
        self.session.read().last_fault().map(str::to_string)
    }

    /// Configuration in use.
    pub fn config(&self) -> &StageConfig {
        &self.config
    }
}
