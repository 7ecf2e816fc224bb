//! Interactive line-oriented host.
//!
//! Exposes every controller operation as a one-word command so the stage can
//! be driven from a terminal:
//!
//! ```text
//! > start 25
//! > voltage
//! > stop
//! > home
//! > rel -2.5
//! ```

use crate::controller::StageController;
use crate::error::ControlError;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, warn};

const HELP: &str = "\
commands:
  start [speed]   start automatic control (speed in mm/s)
  stop            stop automatic control
  home            return to the recorded home position
  min | max       drive to the minimum / maximum limit
  rel <mm>        move by a signed distance
  voltage         show the latest voltage
  status          show control state, home and last fault
  help            show this text
  quit            stop and exit";

/// One console command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsoleCommand {
    /// Start automatic control, optionally overriding the configured speed
    Start(Option<f64>),
    /// Stop automatic control
    Stop,
    /// Return to home
    Home,
    /// Move to minimum
    Min,
    /// Move to maximum
    Max,
    /// Relative move (mm)
    Relative(f64),
    /// Print the latest voltage
    Voltage,
    /// Print the session status
    Status,
    /// Print help
    Help,
    /// Leave the console
    Quit,
}

/// Errors from parsing a console line.
#[derive(Error, Debug, PartialEq)]
pub enum CommandParseError {
    /// First word is not a command
    #[error("unknown command '{0}', type 'help'")]
    Unknown(String),
    /// Required argument absent
    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),
    /// Argument is not a number
    #[error("'{0}' is not a number")]
    InvalidNumber(String),
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, CommandParseError> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };

    let number = |text: &str| {
        text.parse::<f64>()
            .map_err(|_| CommandParseError::InvalidNumber(text.to_string()))
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "start" => ConsoleCommand::Start(words.next().map(number).transpose()?),
        "stop" => ConsoleCommand::Stop,
        "home" => ConsoleCommand::Home,
        "min" => ConsoleCommand::Min,
        "max" => ConsoleCommand::Max,
        "rel" => {
            let text = words
                .next()
                .ok_or(CommandParseError::MissingArgument("rel"))?;
            ConsoleCommand::Relative(number(text)?)
        }
        "voltage" | "v" => ConsoleCommand::Voltage,
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(CommandParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Binds a controller to the two port names used for every command.
pub struct Console<'a> {
    controller: &'a StageController,
    sensor_port: String,
    axis_port: String,
}

impl<'a> Console<'a> {
    /// Console driving `controller` on the given ports.
    pub fn new(
        controller: &'a StageController,
        sensor_port: impl Into<String>,
        axis_port: impl Into<String>,
    ) -> Self {
        Self {
            controller,
            sensor_port: sensor_port.into(),
            axis_port: axis_port.into(),
        }
    }

    /// Execute one command and return the text to show.
    pub async fn execute(&self, command: ConsoleCommand) -> Result<String, ControlError> {
        let controller = self.controller;
        let axis_port = self.axis_port.as_str();

        let reply = match command {
            ConsoleCommand::Start(speed) => {
                let speed = speed.unwrap_or(controller.config().control.default_speed_mm_s);
                controller
                    .start_auto(&self.sensor_port, axis_port, speed)
                    .await?;
                format!("automatic control running at {speed} mm/s")
            }
            ConsoleCommand::Stop => match controller.stop_auto().await {
                Some(summary) => format!(
                    "stopped: {} samples, {} dropped, {} moves to minimum",
                    summary.samples_seen, summary.samples_dropped, summary.triggers
                ),
                None => "automatic control is not running".to_string(),
            },
            ConsoleCommand::Home => {
                controller.return_home(axis_port).await?;
                "returned home".to_string()
            }
            ConsoleCommand::Min => {
                controller.move_to_min(axis_port).await?;
                "at minimum".to_string()
            }
            ConsoleCommand::Max => {
                controller.move_to_max(axis_port).await?;
                "at maximum".to_string()
            }
            ConsoleCommand::Relative(distance) => {
                controller.move_relative(axis_port, distance).await?;
                format!("moved {distance:+} mm")
            }
            ConsoleCommand::Voltage => match controller.latest_sample() {
                Some(sample) => format!(
                    "{:.3} V at {}",
                    sample.value,
                    sample.timestamp.format("%H:%M:%S%.3f")
                ),
                None => "no voltage yet".to_string(),
            },
            ConsoleCommand::Status => {
                let home = controller
                    .home_position()
                    .map_or_else(|| "not set".to_string(), |home| format!("{home:.4} mm"));
                let mut status = format!("state: {}, home: {}", controller.state(), home);
                if let Some(fault) = controller.last_fault() {
                    status.push_str(&format!(", last fault: {fault}"));
                }
                status
            }
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => {
                controller.stop_auto().await;
                "bye".to_string()
            }
        };
        Ok(reply)
    }

    /// Read commands from `input` until `quit` or end of input.
    ///
    /// Operation errors are printed and the console keeps going; only I/O
    /// errors on `input`/`output` end the loop early.
    pub async fn run<R, W>(&self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        output.write_all(b"> ").await?;
        output.flush().await?;

        while let Some(line) = lines.next_line().await? {
            let reply = match parse_command(&line) {
                Ok(None) => None,
                Ok(Some(command)) => {
                    let reply = match self.execute(command).await {
                        Ok(reply) => reply,
                        Err(err) => {
                            if err.is_user_actionable() {
                                warn!(%err, "Command rejected");
                            } else {
                                error!(%err, "Command failed");
                            }
                            format!("error: {err}")
                        }
                    };
                    if command == ConsoleCommand::Quit {
                        output.write_all(format!("{reply}\n").as_bytes()).await?;
                        output.flush().await?;
                        return Ok(());
                    }
                    Some(reply)
                }
                Err(err) => Some(format!("error: {err}")),
            };

            if let Some(reply) = reply {
                output.write_all(format!("{reply}\n").as_bytes()).await?;
            }
            output.write_all(b"> ").await?;
            output.flush().await?;
        }

        self.controller.stop_auto().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::hardware::mock::{MockAxis, MockAxisConnector, MockSensorOpener};
    use std::sync::Arc;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("  "), Ok(None));
        assert_eq!(
            parse_command("start"),
            Ok(Some(ConsoleCommand::Start(None)))
        );
        assert_eq!(
            parse_command("START 12.5"),
            Ok(Some(ConsoleCommand::Start(Some(12.5))))
        );
        assert_eq!(
            parse_command("rel -3"),
            Ok(Some(ConsoleCommand::Relative(-3.0)))
        );
        assert_eq!(parse_command("v"), Ok(Some(ConsoleCommand::Voltage)));
        assert_eq!(
            parse_command("rel"),
            Err(CommandParseError::MissingArgument("rel"))
        );
        assert_eq!(
            parse_command("rel abc"),
            Err(CommandParseError::InvalidNumber("abc".to_string()))
        );
        assert_eq!(
            parse_command("jog"),
            Err(CommandParseError::Unknown("jog".to_string()))
        );
    }

    #[tokio::test]
    async fn test_console_session_transcript() {
        let mut config = StageConfig::default();
        config.control.poll_interval_ms = 1;
        config.axis.busy_poll_interval_ms = 1;
        let axes = MockAxisConnector::new(MockAxis::with_position(10.0));
        let controller = StageController::new(
            config,
            Arc::new(MockSensorOpener::new()),
            Arc::new(axes.clone()),
        );
        let console = Console::new(&controller, "sensor", "axis");

        let input: &[u8] = b"home\nstart 5\nmin\nstop\nrel 2.5\nhome\nstatus\nbogus\nquit\nmax\n";
        let mut output = Vec::new();
        console.run(input, &mut output).await.unwrap();
        let transcript = String::from_utf8(output).unwrap();

        assert!(transcript.contains("home position not set"));
        assert!(transcript.contains("automatic control running at 5 mm/s"));
        assert!(transcript.contains("automatic control is active"));
        assert!(transcript.contains("moved +2.5 mm"));
        assert!(transcript.contains("returned home"));
        assert!(transcript.contains("state: idle, home: 10.0000 mm"));
        assert!(transcript.contains("unknown command 'bogus'"));
        assert!(transcript.ends_with("bye\n"));

        // Nothing after quit runs
        assert_eq!(axes.axis().count(crate::hardware::MotionCommand::MoveToMax), 0);
        assert_eq!(axes.axis().peek_position(), 10.0);
        assert!(axes.counter().is_balanced());
    }
}
