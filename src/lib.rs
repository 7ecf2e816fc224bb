//! # Stage Trigger Library
//!
//! Voltage-triggered control of a linear motion stage. A sensor
//! microcontroller streams voltages over one serial link; while automatic
//! control runs, every sample below the threshold drives the axis (a Zaber
//! ASCII device on a second serial link) to its minimum limit. Manual
//! one-shot commands are available whenever automatic control is stopped.
//!
//! ## Crate Structure
//!
//! - **`config`**: `StageConfig` loaded from TOML and `STAGE_TRIGGER_*` environment variables.
//! - **`console`**: Interactive line-oriented host over a `StageController`.
//! - **`control_loop`**: `AutoSession`, the Connecting/Running/Stopping/Faulted state machine.
//! - **`controller`**: `StageController`, the host-facing operation surface.
//! - **`error`**: `ControlError` and the `AppResult` alias.
//! - **`hardware`**: `Axis` capability traits, the Zaber driver and mock devices.
//! - **`manual`**: `ManualDispatcher`, scoped one-shot motion commands.
//! - **`sensor`**: sensor transport traits, the serial implementation and voltage parsing.
//! - **`serial`**: shared tokio-serial plumbing.
//! - **`session`**: `SessionState` shared between the loop, the dispatcher and the host.
//! - **`tracing_setup`**: tracing subscriber initialisation.

pub mod config;
pub mod console;
pub mod control_loop;
pub mod controller;
pub mod error;
pub mod hardware;
pub mod manual;
pub mod sensor;
pub mod serial;
pub mod session;
pub mod tracing_setup;

pub use config::StageConfig;
pub use controller::StageController;
pub use error::{AppResult, ControlError};
