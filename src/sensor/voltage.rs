//! Voltage samples decoded from the sensor line protocol.
//!
//! Each line from the microcontroller carries one decimal voltage, e.g. `3.87`.
//! Anything that is not a single finite float is rejected with
//! [`ControlError::Parse`] and dropped by the caller.

use crate::error::{AppResult, ControlError};
use chrono::{DateTime, Utc};

/// One voltage reading with the time it was decoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageSample {
    /// Voltage in volts
    pub value: f64,
    /// When the line was decoded
    pub timestamp: DateTime<Utc>,
}

impl VoltageSample {
    /// Create a sample stamped with the current time.
    pub fn now(value: f64) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }

    /// Whether this sample lies strictly below `threshold`.
    pub fn is_below(&self, threshold: f64) -> bool {
        self.value < threshold
    }
}

/// Parse one sensor line into a sample.
///
/// Surrounding whitespace and line terminators are ignored.
pub fn parse_voltage_line(line: &str) -> AppResult<VoltageSample> {
    let text = line.trim();
    let value: f64 = text
        .parse()
        .map_err(|_| ControlError::Parse(text.to_string()))?;

    // "NaN" and "inf" parse as f64 but are not voltages
    if !value.is_finite() {
        return Err(ControlError::Parse(text.to_string()));
    }

    Ok(VoltageSample::now(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_lines() {
        assert_eq!(parse_voltage_line("3.87").unwrap().value, 3.87);
        assert_eq!(parse_voltage_line("4.5\r\n").unwrap().value, 4.5);
        assert_eq!(parse_voltage_line("  0 ").unwrap().value, 0.0);
        assert_eq!(parse_voltage_line("-0.25").unwrap().value, -0.25);
    }

    #[test]
    fn test_parse_malformed_lines() {
        for line in ["N/A", "", "3.2.1", "volts", "NaN", "inf", "4,5"] {
            assert!(
                matches!(parse_voltage_line(line), Err(ControlError::Parse(_))),
                "expected parse error for {:?}",
                line
            );
        }
    }

    #[test]
    fn test_is_below_threshold() {
        assert!(VoltageSample::now(3.9).is_below(4.0));
        assert!(!VoltageSample::now(4.0).is_below(4.0));
        assert!(!VoltageSample::now(4.1).is_below(4.0));
    }
}
