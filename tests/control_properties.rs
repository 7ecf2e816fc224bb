//! Integration tests for the host operation surface.
//!
//! Every test drives a `StageController` over the mock sensor and axis, so
//! connection bookkeeping and driver calls can be inspected afterwards.

use stage_trigger::config::StageConfig;
use stage_trigger::error::{ControlError, Precondition};
use stage_trigger::hardware::mock::{
    MockAxis, MockAxisConnector, MockSensorOpener, OpenFailure, SensorEvent,
};
use stage_trigger::hardware::MotionCommand;
use stage_trigger::session::ControlState;
use stage_trigger::StageController;
use std::sync::Arc;
use std::time::Duration;

const SENSOR: &str = "/dev/ttyACM0";
const AXIS: &str = "/dev/ttyUSB0";

struct Rig {
    controller: StageController,
    sensors: MockSensorOpener,
    axes: MockAxisConnector,
}

impl Rig {
    fn new(sensors: MockSensorOpener, axis: MockAxis) -> Self {
        let mut config = StageConfig::default();
        config.control.poll_interval_ms = 1;
        config.axis.busy_poll_interval_ms = 1;
        config.axis.max_move_wait_secs = 2;

        let axes = MockAxisConnector::new(axis);
        let controller =
            StageController::new(config, Arc::new(sensors.clone()), Arc::new(axes.clone()));
        Self {
            controller,
            sensors,
            axes,
        }
    }

    fn axis(&self) -> &MockAxis {
        self.axes.axis()
    }

    fn assert_balanced(&self) {
        let sensors = self.sensors.counter();
        let axes = self.axes.counter();
        assert!(
            sensors.is_balanced(),
            "sensor opened {} closed {}",
            sensors.opened(),
            sensors.closed()
        );
        assert!(
            axes.is_balanced(),
            "axis opened {} closed {}",
            axes.opened(),
            axes.closed()
        );
    }

    /// Poll until `done` holds, failing after one second.
    async fn wait_for(&self, what: &str, done: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !done(self) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

// =============================================================================
// Threshold policy
// =============================================================================

#[tokio::test]
async fn test_one_move_to_min_per_low_sample() {
    let rig = Rig::new(
        MockSensorOpener::with_lines(["4.5", "3.9", "3.8", "4.1"]),
        MockAxis::with_position(30.0),
    );

    rig.controller.start_auto(SENSOR, AXIS, 15.0).await.unwrap();
    rig.wait_for("last sample", |rig| {
        rig.controller.current_voltage() == Some(4.1)
    })
    .await;
    let summary = rig.controller.stop_auto().await.unwrap();

    assert_eq!(rig.axis().count(MotionCommand::MoveToMin), 2);
    assert_eq!(rig.axis().count(MotionCommand::SetSpeed(15.0)), 2);
    assert_eq!(rig.axis().max_speed(), Some(15.0));
    assert_eq!(
        rig.axis().commands(),
        vec![
            MotionCommand::SetSpeed(15.0),
            MotionCommand::MoveToMin,
            MotionCommand::SetSpeed(15.0),
            MotionCommand::MoveToMin,
        ]
    );
    assert_eq!(summary.triggers, 2);
    assert_eq!(summary.samples_seen, 4);
    assert!(summary.fault.is_none());
    rig.assert_balanced();
}

#[tokio::test]
async fn test_malformed_lines_are_ignored() {
    let rig = Rig::new(
        MockSensorOpener::with_lines(["4.6", "N/A", "", "3.2.1", "volts", "4.7"]),
        MockAxis::new(),
    );

    rig.controller.start_auto(SENSOR, AXIS, 10.0).await.unwrap();
    rig.wait_for("trailing sample", |rig| {
        rig.controller.current_voltage() == Some(4.7)
    })
    .await;
    let summary = rig.controller.stop_auto().await.unwrap();

    assert_eq!(summary.samples_dropped, 4);
    assert_eq!(summary.samples_seen, 2);
    assert!(rig.axis().commands().is_empty());
    assert!(rig.controller.last_fault().is_none());
}

#[tokio::test]
async fn test_malformed_line_keeps_previous_voltage() {
    let sensors = MockSensorOpener::with_lines(["4.25", "garbage"]);
    let rig = Rig::new(sensors, MockAxis::new());

    rig.controller.start_auto(SENSOR, AXIS, 10.0).await.unwrap();
    rig.wait_for("script drained", |rig| rig.sensors.remaining() == 0)
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(rig.controller.current_voltage(), Some(4.25));
    assert!(rig.controller.latest_sample().is_some());
    rig.controller.stop_auto().await;
    rig.assert_balanced();
}

#[tokio::test]
async fn test_voltage_equal_to_threshold_does_not_trigger() {
    let rig = Rig::new(MockSensorOpener::with_lines(["4.0", "4.0"]), MockAxis::new());

    rig.controller.start_auto(SENSOR, AXIS, 10.0).await.unwrap();
    rig.wait_for("script drained", |rig| rig.sensors.remaining() == 0)
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    rig.controller.stop_auto().await;

    assert_eq!(rig.axis().count(MotionCommand::MoveToMin), 0);
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn test_sensor_disconnect_faults_and_closes_everything() {
    let sensors = MockSensorOpener::with_lines(["4.4", "3.1"]);
    sensors.push_event(SensorEvent::Disconnect);
    let rig = Rig::new(sensors, MockAxis::new());

    rig.controller.start_auto(SENSOR, AXIS, 10.0).await.unwrap();
    rig.wait_for("fault", |rig| !rig.controller.is_running())
        .await;

    assert_eq!(rig.controller.state(), ControlState::Idle);
    assert!(rig.controller.last_fault().is_some());
    assert_eq!(rig.axis().count(MotionCommand::MoveToMin), 1);

    let summary = rig.controller.stop_auto().await.unwrap();
    assert!(summary.fault.is_some());
    rig.assert_balanced();
}

#[tokio::test]
async fn test_driver_fault_mid_session_closes_everything() {
    let rig = Rig::new(MockSensorOpener::with_lines(["4.8"]), MockAxis::new());

    rig.controller.start_auto(SENSOR, AXIS, 10.0).await.unwrap();
    rig.axis().inject_fault("motor driver overheated");
    rig.sensors.push_line("2.0");

    rig.wait_for("fault", |rig| !rig.controller.is_running())
        .await;

    let fault = rig.controller.last_fault().unwrap();
    assert!(fault.contains("motor driver overheated"));
    rig.assert_balanced();

    // A fresh start is required and works
    rig.controller.start_auto(SENSOR, AXIS, 10.0).await.unwrap();
    assert!(rig.controller.is_running());
    assert!(rig.controller.last_fault().is_none());
    rig.controller.stop_auto().await;
    rig.assert_balanced();
}

#[tokio::test]
async fn test_no_leak_across_repeated_sessions_and_failures() {
    let rig = Rig::new(MockSensorOpener::new(), MockAxis::new());

    for round in 0..5 {
        if round % 2 == 1 {
            rig.axes.fail_connect(OpenFailure::NoDeviceDetected);
            let result = rig.controller.start_auto(SENSOR, AXIS, 10.0).await;
            assert!(matches!(result, Err(ControlError::NoDeviceDetected { .. })));
            rig.axes.clear_failure();
        } else {
            rig.controller.start_auto(SENSOR, AXIS, 10.0).await.unwrap();
            rig.controller.stop_auto().await;
        }
        rig.assert_balanced();
    }

    assert_eq!(rig.sensors.counter().opened(), 5);
    assert_eq!(rig.axes.counter().opened(), 3);
}

#[tokio::test]
async fn test_permission_denied_is_distinguished() {
    let sensors = MockSensorOpener::new();
    sensors.fail_open(OpenFailure::PermissionDenied);
    let rig = Rig::new(sensors, MockAxis::new());

    let err = rig
        .controller
        .start_auto(SENSOR, AXIS, 10.0)
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::PermissionDenied { ref port } if port == SENSOR));
    assert!(err.to_string().contains("in use by another application"));
    assert_eq!(rig.axes.counter().opened(), 0);
    assert!(!rig.controller.is_running());
    assert_eq!(rig.controller.state(), ControlState::Idle);
}

#[tokio::test]
async fn test_missing_port_reports_unavailable() {
    let sensors = MockSensorOpener::new();
    sensors.fail_open(OpenFailure::PortUnavailable);
    let rig = Rig::new(sensors, MockAxis::new());

    let err = rig
        .controller
        .start_auto(SENSOR, AXIS, 10.0)
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::PortUnavailable { .. }));
    assert!(rig.controller.last_fault().is_some());
}

#[tokio::test]
async fn test_stop_is_observed_within_a_tick() {
    let rig = Rig::new(
        MockSensorOpener::triangle_wave(4.5, 5.0, 0.1, Duration::from_millis(5)),
        MockAxis::new(),
    );

    rig.controller.start_auto(SENSOR, AXIS, 10.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let summary = tokio::time::timeout(Duration::from_millis(500), rig.controller.stop_auto())
        .await
        .unwrap()
        .unwrap();

    assert!(summary.samples_seen > 0);
    assert_eq!(rig.controller.state(), ControlState::Idle);
    rig.assert_balanced();
}

// =============================================================================
// Manual commands
// =============================================================================

#[tokio::test]
async fn test_return_home_before_any_session() {
    let rig = Rig::new(MockSensorOpener::new(), MockAxis::new());

    let result = rig.controller.return_home(AXIS).await;

    assert!(matches!(
        result,
        Err(ControlError::Precondition(Precondition::HomeNotRecorded))
    ));
    assert!(rig.axis().calls().is_empty());
    assert_eq!(rig.axes.counter().opened(), 0);
}

#[tokio::test]
async fn test_manual_commands_rejected_while_running() {
    let rig = Rig::new(MockSensorOpener::new(), MockAxis::with_position(12.0));
    rig.controller.start_auto(SENSOR, AXIS, 10.0).await.unwrap();
    let calls_before = rig.axis().calls().len();
    let opens_before = rig.axes.counter().opened();

    let results = [
        rig.controller.return_home(AXIS).await,
        rig.controller.move_to_min(AXIS).await,
        rig.controller.move_to_max(AXIS).await,
        rig.controller.move_relative(AXIS, 1.0).await,
    ];

    for result in results {
        assert!(matches!(
            result,
            Err(ControlError::Precondition(Precondition::AutomaticModeActive))
        ));
    }
    assert_eq!(rig.axis().calls().len(), calls_before);
    assert_eq!(rig.axes.counter().opened(), opens_before);
    assert!(rig.controller.is_running());

    rig.controller.stop_auto().await;
    rig.assert_balanced();
}

#[tokio::test]
async fn test_relative_round_trip_and_return_home() {
    let rig = Rig::new(MockSensorOpener::new(), MockAxis::with_position(18.0));

    rig.controller.start_auto(SENSOR, AXIS, 10.0).await.unwrap();
    rig.controller.stop_auto().await;
    assert_eq!(rig.controller.home_position(), Some(18.0));

    rig.controller.move_relative(AXIS, 3.5).await.unwrap();
    assert_eq!(rig.axis().peek_position(), 21.5);
    rig.controller.move_relative(AXIS, -3.5).await.unwrap();
    assert_eq!(rig.axis().peek_position(), 18.0);

    rig.controller.move_to_max(AXIS).await.unwrap();
    assert_eq!(rig.axis().peek_position(), 50.0);
    rig.controller.return_home(AXIS).await.unwrap();
    assert_eq!(rig.axis().peek_position(), 18.0);

    rig.controller.move_to_min(AXIS).await.unwrap();
    assert_eq!(rig.axis().peek_position(), 0.0);
    rig.assert_balanced();
}

#[tokio::test]
async fn test_manual_error_does_not_change_running() {
    let rig = Rig::new(MockSensorOpener::new(), MockAxis::new().stalled());

    let result = rig.controller.move_to_max(AXIS).await;

    assert!(matches!(result, Err(ControlError::MoveTimeout(_))));
    assert!(!rig.controller.is_running());
    assert_eq!(rig.controller.state(), ControlState::Idle);
    rig.assert_balanced();
}

// =============================================================================
// Speed validation
// =============================================================================

#[test]
fn test_out_of_range_speed_rejected_before_connecting() {
    let rig = Rig::new(MockSensorOpener::new(), MockAxis::new());

    for speed in [0.0, 0.099, -5.0, 700.01, f64::INFINITY] {
        let result = tokio_test::block_on(rig.controller.start_auto(SENSOR, AXIS, speed));
        assert!(matches!(result, Err(ControlError::InvalidSpeed(s)) if s == speed));
    }

    assert_eq!(rig.sensors.counter().opened(), 0);
    assert_eq!(rig.axes.counter().opened(), 0);
    assert!(rig.controller.home_position().is_none());
}

#[test]
fn test_speed_bounds_are_inclusive() {
    let rig = Rig::new(MockSensorOpener::new(), MockAxis::new());

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        for speed in [0.1, 700.0] {
            rig.controller.start_auto(SENSOR, AXIS, speed).await.unwrap();
            rig.controller.stop_auto().await;
        }
    });

    assert_eq!(rig.sensors.counter().opened(), 2);
    rig.assert_balanced();
}
