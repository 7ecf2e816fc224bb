//! CLI Entry Point for stage-trigger
//!
//! Provides command-line access to:
//! - Automatic control (runs until Ctrl-C or a fault)
//! - An interactive console exposing every host operation
//! - One-shot manual moves
//!
//! # Usage
//!
//! ```bash
//! stage-trigger auto --sensor-port /dev/ttyACM0 --axis-port /dev/ttyUSB0 --speed 25
//! stage-trigger move-rel --axis-port /dev/ttyUSB0 -- -2.5
//! stage-trigger --simulate console
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use stage_trigger::console::Console;
use stage_trigger::hardware::mock::{MockAxis, MockAxisConnector, MockSensorOpener};
use stage_trigger::tracing_setup::{self, OutputFormat, TracingConfig};
use stage_trigger::{StageConfig, StageController};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{info, warn};

const SIMULATED_PORT: &str = "simulated";

#[derive(Parser)]
#[command(name = "stage-trigger")]
#[command(about = "Voltage-triggered motion stage control", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/stage.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use in-process mock hardware instead of serial ports
    #[arg(long, global = true)]
    simulate: bool,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    /// Log span open and close events
    #[arg(long, global = true)]
    log_spans: bool,

    /// Disable colored log output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run automatic control until Ctrl-C
    Auto {
        /// Sensor microcontroller port
        #[arg(long)]
        sensor_port: Option<String>,

        /// Motion stage port
        #[arg(long)]
        axis_port: Option<String>,

        /// Speed for triggered moves in mm/s (defaults to control.default_speed_mm_s)
        #[arg(long)]
        speed: Option<f64>,
    },

    /// Interactive console
    Console {
        /// Sensor microcontroller port
        #[arg(long)]
        sensor_port: Option<String>,

        /// Motion stage port
        #[arg(long)]
        axis_port: Option<String>,
    },

    /// Drive the axis to its minimum limit
    MoveMin {
        /// Motion stage port
        #[arg(long)]
        axis_port: Option<String>,
    },

    /// Drive the axis to its maximum limit
    MoveMax {
        /// Motion stage port
        #[arg(long)]
        axis_port: Option<String>,
    },

    /// Move the axis by a signed distance
    MoveRel {
        /// Motion stage port
        #[arg(long)]
        axis_port: Option<String>,

        /// Distance in mm
        #[arg(allow_hyphen_values = true)]
        distance: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StageConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => StageConfig::load().context("Failed to load configuration")?,
    };
    config.validate()?;

    tracing_setup::init(
        TracingConfig::from_config(&config)?
            .with_format(cli.log_format)
            .with_span_events(cli.log_spans)
            .with_ansi(!cli.no_color),
    )?;
    info!(name = %config.application.name, simulate = cli.simulate, "Starting");

    let controller = if cli.simulate {
        simulated_controller(config)
    } else {
        StageController::with_hardware(config)
    };
    let port = |name: Option<String>, what: &str| resolve_port(name, what, cli.simulate);

    match cli.command {
        Commands::Auto {
            sensor_port,
            axis_port,
            speed,
        } => {
            let sensor_port = port(sensor_port, "--sensor-port")?;
            let axis_port = port(axis_port, "--axis-port")?;
            run_auto(&controller, &sensor_port, &axis_port, speed).await
        }
        Commands::Console {
            sensor_port,
            axis_port,
        } => {
            let console = Console::new(
                &controller,
                port(sensor_port, "--sensor-port")?,
                port(axis_port, "--axis-port")?,
            );
            console
                .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
                .await?;
            Ok(())
        }
        Commands::MoveMin { axis_port } => {
            controller
                .move_to_min(&port(axis_port, "--axis-port")?)
                .await?;
            println!("at minimum");
            Ok(())
        }
        Commands::MoveMax { axis_port } => {
            controller
                .move_to_max(&port(axis_port, "--axis-port")?)
                .await?;
            println!("at maximum");
            Ok(())
        }
        Commands::MoveRel {
            axis_port,
            distance,
        } => {
            controller
                .move_relative(&port(axis_port, "--axis-port")?, distance)
                .await?;
            println!("moved {distance:+} mm");
            Ok(())
        }
    }
}

fn resolve_port(name: Option<String>, flag: &str, simulate: bool) -> Result<String> {
    match name {
        Some(name) => Ok(name),
        None if simulate => Ok(SIMULATED_PORT.to_string()),
        None => bail!("{flag} is required unless --simulate is given"),
    }
}

fn simulated_controller(config: StageConfig) -> StageController {
    // Sweeps across the default 4 V threshold every few seconds
    let sensors = MockSensorOpener::triangle_wave(3.0, 5.0, 0.05, Duration::from_millis(50));
    let axes = MockAxisConnector::new(MockAxis::with_position(25.0).with_busy_polls(3));
    StageController::new(config, Arc::new(sensors), Arc::new(axes))
}

async fn run_auto(
    controller: &StageController,
    sensor_port: &str,
    axis_port: &str,
    speed: Option<f64>,
) -> Result<()> {
    let speed = speed.unwrap_or(controller.config().control.default_speed_mm_s);
    controller.start_auto(sensor_port, axis_port, speed).await?;
    println!("Automatic control running. Press Ctrl-C to stop.");

    let mut status = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(%err, "Failed to listen for Ctrl-C");
                }
                break;
            }
            _ = status.tick() => {
                if !controller.is_running() {
                    break;
                }
            }
        }
    }

    let summary = controller.stop_auto().await;
    if let Some(summary) = &summary {
        println!(
            "{} samples, {} dropped, {} moves to minimum",
            summary.samples_seen, summary.samples_dropped, summary.triggers
        );
    }

    match summary.and_then(|summary| summary.fault) {
        Some(fault) => bail!("Automatic control faulted: {fault}"),
        None => Ok(()),
    }
}
