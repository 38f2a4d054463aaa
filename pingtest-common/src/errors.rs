//! Error taxonomy for device sessions, parsing and scenario validation.
//!
//! Everything below the execution engine reports through these types; the
//! engine folds them into an FT [`crate::TestResult`] so nothing escapes to
//! the scheduler.

use crate::retry::RetryableError;

/// Errors raised by a terminal session (SSH tunnel or raw Telnet).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    #[error("connection to {target} timed out after {secs}s")]
    Timeout { target: String, secs: u64 },

    #[error("authentication rejected by {target} for user {user}")]
    Auth { target: String, user: String },

    #[error("session I/O error: {0}")]
    Io(String),

    #[error("session closed by remote host")]
    Closed,

    #[error("invalid prompt pattern: {0}")]
    Pattern(String),
}

impl RetryableError for SessionError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout { .. } | Self::Auth { .. }
        )
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors raised while turning terminal text into structured data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Packet loss not found in: {excerpt}...")]
    PacketLossMissing { excerpt: String },

    #[error("Invalid packet loss value: {0}")]
    InvalidPacketLoss(String),

    #[error("Unknown outcome code: {0}")]
    UnknownOutcome(String),
}

/// Errors raised when a scenario cannot be executed as given.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("scenario must have exactly 5 fields, got {0}")]
    FieldCount(usize),

    #[error("scenario field {index} ({field}) has the wrong type: expected {expected}")]
    FieldType {
        index: usize,
        field: &'static str,
        expected: &'static str,
    },

    #[error("scenario field {field} must not be empty")]
    Empty { field: &'static str },

    #[error("scenario field {field} must not contain whitespace: {value:?}")]
    Whitespace { field: &'static str, value: String },

    #[error("scenario port out of range: {0} (valid: 1..=65535)")]
    PortOutOfRange(i64),
}
