//! Scenario and result types shared between the engine, store and scheduler.

use crate::classify::Outcome;
use crate::errors::ValidationError;
use crate::util::truncate_chars;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Prefix shared by every recurring test job name.
pub const JOB_NAMESPACE: &str = "network_test_schedule";

/// Maximum length of an error message produced by the execution engine.
pub const ERROR_MAX_CHARS: usize = 1000;

const FIELD_NAMES: [&str; 5] = ["host", "port", "destination", "device_name", "test_name"];

/// Derive the recurring job name for a device/destination pair.
///
/// Deterministic so that re-registering the same scenario replaces its job
/// instead of adding a second one.
pub fn job_name_for(device_name: &str, destination: &str) -> String {
    format!("{JOB_NAMESPACE}_{device_name}_{destination}")
}

/// The five positional fields that describe one ping test.
///
/// `port` stays a wide signed integer so values that arrive out of range
/// from the store are rejected by [`ScenarioArgs::validate`] instead of
/// failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScenarioArgs {
    /// Device management address, reached with `telnet <host> <port>`.
    pub host: String,
    pub port: i64,
    /// Address pinged from the device.
    pub destination: String,
    /// Device prompt name; the CLI prompt reads `<device_name>`.
    pub device_name: String,
    /// Free-form label, not unique.
    pub test_name: String,
}

impl ScenarioArgs {
    pub fn new(
        host: impl Into<String>,
        port: i64,
        destination: impl Into<String>,
        device_name: impl Into<String>,
        test_name: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            destination: destination.into(),
            device_name: device_name.into(),
            test_name: test_name.into(),
        }
    }

    /// Recurring job name for this scenario.
    pub fn job_name(&self) -> String {
        job_name_for(&self.device_name, &self.destination)
    }

    /// Validated port, or the reason it is unusable.
    pub fn port_u16(&self) -> Result<u16, ValidationError> {
        u16::try_from(self.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ValidationError::PortOutOfRange(self.port))
    }

    /// Check the fields are usable for a device session.
    ///
    /// Host, destination and device name are interpolated into CLI commands
    /// and prompt patterns, so they must be non-empty single tokens.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("host", &self.host),
            ("destination", &self.destination),
            ("device_name", &self.device_name),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::Empty { field });
            }
            if value.chars().any(char::is_whitespace) {
                return Err(ValidationError::Whitespace {
                    field,
                    value: value.clone(),
                });
            }
        }
        self.port_u16()?;
        Ok(())
    }

    /// Encode as the positional job argument list.
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            Value::from(self.host.clone()),
            Value::from(self.port),
            Value::from(self.destination.clone()),
            Value::from(self.device_name.clone()),
            Value::from(self.test_name.clone()),
        ]
    }

    /// Decode a positional job argument list.
    ///
    /// Requires exactly five entries with the right JSON types; field
    /// contents are checked separately by [`ScenarioArgs::validate`].
    pub fn from_args(args: &[Value]) -> Result<Self, ValidationError> {
        if args.len() != FIELD_NAMES.len() {
            return Err(ValidationError::FieldCount(args.len()));
        }
        let text = |index: usize| -> Result<String, ValidationError> {
            args[index]
                .as_str()
                .map(str::to_string)
                .ok_or(ValidationError::FieldType {
                    index,
                    field: FIELD_NAMES[index],
                    expected: "string",
                })
        };
        let port = args[1].as_i64().ok_or(ValidationError::FieldType {
            index: 1,
            field: FIELD_NAMES[1],
            expected: "integer",
        })?;
        Ok(Self {
            host: text(0)?,
            port,
            destination: text(2)?,
            device_name: text(3)?,
            test_name: text(4)?,
        })
    }
}

impl fmt::Display for ScenarioArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}) -> {} [{}]",
            self.device_name, self.host, self.port, self.destination, self.test_name
        )
    }
}

/// A scenario row as stored by the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub id: i64,
    pub args: ScenarioArgs,
    pub active: bool,
}

/// Outcome of one ping execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub telnet_host: String,
    pub telnet_port: i64,
    pub ping_destination: String,
    /// Filled in by the engine; the driver does not know the label.
    pub test_name: Option<String>,
    pub device_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub outcome: Outcome,
    pub statistics: String,
    pub error: String,
}

impl TestResult {
    /// A result that has not produced any evidence yet: FT, empty text,
    /// both timestamps set to now.
    pub fn pending(
        host: impl Into<String>,
        port: i64,
        destination: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            telnet_host: host.into(),
            telnet_port: port,
            ping_destination: destination.into(),
            test_name: None,
            device_name: device_name.into(),
            start_time: now,
            end_time: now,
            outcome: Outcome::TotalFailure,
            statistics: String::new(),
            error: String::new(),
        }
    }

    /// FT result describing a failure that happened before or instead of a
    /// ping run.
    ///
    /// `fields` are the raw positional scenario fields, of which any prefix
    /// may be missing or malformed; whatever is readable is kept for
    /// identification.
    pub fn failure(error: impl fmt::Display, fields: &[Value]) -> Self {
        let text = |index: usize| {
            fields
                .get(index)
                .map(|v| match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                })
                .unwrap_or_else(|| "unknown".to_string())
        };
        let port = fields.get(1).and_then(Value::as_i64).unwrap_or(0);
        let mut result = Self::pending(text(0), port, text(2), text(3));
        result.test_name = Some(text(4));
        result.error = truncate_chars(&error.to_string(), ERROR_MAX_CHARS);
        result
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}) = {} - {} [{} - {}]",
            self.device_name,
            self.telnet_host,
            self.telnet_port,
            self.test_name.as_deref().unwrap_or(""),
            self.ping_destination,
            self.start_time.to_rfc3339(),
            self.end_time.to_rfc3339()
        )
    }
}
