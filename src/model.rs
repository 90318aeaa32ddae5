//! Data types exchanged between the sensor, the control loop and the
//! collection service.
//!
//! The wire shapes here match what the collection service expects on
//! `{base_url}readings` and `{base_url}logs`.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Severity of a log event submitted to the collection service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// Event identifiers understood by the collection service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCode {
    /// The PM sensor kept failing to produce a frame.
    SensorPm25ReadFail,
    /// The agent started.
    DevicePowerOn,
    /// Any other service-defined code.
    Other(u16),
}

impl LogCode {
    /// Numeric code sent on the wire.
    pub fn as_u16(&self) -> u16 {
        match self {
            LogCode::SensorPm25ReadFail => 14,
            LogCode::DevicePowerOn => 31,
            LogCode::Other(code) => *code,
        }
    }
}

impl Serialize for LogCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

/// A notable condition reported out of band to the collection service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub severity: Severity,
    pub code: LogCode,
    pub message: String,
}

impl LogEvent {
    pub fn new(severity: Severity, code: LogCode, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
        }
    }

    /// Event sent once when the control loop enters its running state.
    pub fn power_on() -> Self {
        Self::new(Severity::Info, LogCode::DevicePowerOn, "Starting Up")
    }

    /// Escalation for a sensor that failed more than `threshold` times in a row.
    pub fn excessive_read_failure(threshold: u32) -> Self {
        Self::new(
            Severity::Warning,
            LogCode::SensorPm25ReadFail,
            format!("Excessive PM read failure, > {}", threshold),
        )
    }
}

/// One particulate-matter reading, in µg/m³ (environmental units).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub pm1_0: u16,
    pub pm2_5: u16,
    pub pm10: u16,
    pub observed_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(pm1_0: u16, pm2_5: u16, pm10: u16) -> Self {
        Self {
            pm1_0,
            pm2_5,
            pm10,
            observed_at: Utc::now(),
        }
    }

    /// Body posted to the readings endpoint.
    pub fn payload(&self) -> ReadingPayload {
        ReadingPayload {
            pm25: self.pm2_5,
            pm10: self.pm1_0,
            pm100: self.pm10,
        }
    }
}

impl std::fmt::Display for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, PM 1.0: {}, PM 2.5: {}, PM 10: {}",
            self.observed_at.format("%Y-%m-%d %H:%M:%S"),
            self.pm1_0,
            self.pm2_5,
            self.pm10
        )
    }
}

/// Wire format of a reading.
///
/// The service names fields after the sensor's register names, so `pm10`
/// carries PM1.0 and `pm100` carries PM10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadingPayload {
    pub pm25: u16,
    pub pm10: u16,
    pub pm100: u16,
}
