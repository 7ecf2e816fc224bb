//! Axis Driver Adapter
//!
//! Capability traits for the motion stage plus the concrete backends:
//! the Zaber ASCII driver for real hardware and in-process mocks.

pub mod axis;
pub mod mock;
pub mod zaber;

pub use axis::{
    wait_until_idle, Axis, AxisConnection, AxisConnector, AxisHandle, MotionCommand, MoveWait,
};
pub use zaber::ZaberConnector;
