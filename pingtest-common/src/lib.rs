//! Shared types and utilities for the pingtest daemon.
//!
//! Holds everything that does not need a device connection or a database:
//! the scenario/result data model, packet-loss classification, the error
//! taxonomy, configuration loading, retry policy and logging setup.

pub mod classify;
pub mod config;
pub mod errors;
pub mod logging;
pub mod retry;
pub mod types;
pub mod util;

pub use classify::{Outcome, classify_packet_loss, parse_packet_loss};
pub use config::{Backend, ConfigError, PingtestConfig, SshConfig, TelnetConfig};
pub use errors::{ParseError, SessionError, ValidationError};
pub use retry::{RetryPolicy, RetryableError, run_with_retry};
pub use types::{
    ERROR_MAX_CHARS, JOB_NAMESPACE, ScenarioArgs, ScenarioRecord, TestResult, job_name_for,
};
pub use util::truncate_chars;
