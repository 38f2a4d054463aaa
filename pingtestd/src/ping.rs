//! Ping test driver.
//!
//! Runs `ping -c 1000 <destination>` on a logged-in device session, waits
//! for the prompt to come back and turns the statistics block into a
//! [`TestResult`]. A ping that never finishes is interrupted with Ctrl-C
//! and whatever it printed by then is searched once more.

use crate::session::{Session, Transport, device_prompt};
use chrono::Utc;
use pingtest_common::classify::classify_statistics;
use pingtest_common::util::log_snippet;
use pingtest_common::{ParseError, SessionError, TestResult};
use regex::Regex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Echo requests per run.
pub const PING_COUNT: u32 = 1000;

/// Upper bound on one run: 1000 probes plus headroom for slow replies.
pub const PING_TIMEOUT: Duration = Duration::from_secs(418);

/// Wait after Ctrl-C before collecting the tail of the output.
pub const ABORT_SETTLE: Duration = Duration::from_secs(2);

pub const STATISTICS_NOT_FOUND: &str = "Ping statistics not found after aborting.";

#[derive(Debug, thiserror::Error)]
enum PingError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("invalid statistics pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Pattern capturing the statistics block up to the returning prompt.
pub fn statistics_pattern(destination: &str, device_name: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r"(?s)(-+ {} ping statistics -+.*?)<{}>",
        regex::escape(destination),
        regex::escape(device_name)
    ))
}

/// Trimmed statistics block, if `output` contains one.
pub fn extract_statistics(output: &str, pattern: &Regex) -> Option<String> {
    pattern
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Drives ping runs over an already logged-in session.
#[derive(Debug, Clone)]
pub struct PingDriver {
    count: u32,
    timeout: Duration,
    abort_settle: Duration,
}

impl Default for PingDriver {
    fn default() -> Self {
        Self {
            count: PING_COUNT,
            timeout: PING_TIMEOUT,
            abort_settle: ABORT_SETTLE,
        }
    }
}

impl PingDriver {
    /// Run one ping and describe it; never fails.
    ///
    /// `test_name` is left unset; the engine knows the label.
    pub async fn run<T: Transport>(
        &self,
        session: &mut Session<T>,
        host: &str,
        port: i64,
        destination: &str,
        device_name: &str,
    ) -> TestResult {
        let mut result = TestResult::pending(host, port, destination, device_name);

        if let Err(e) = self
            .execute(session, &mut result, destination, device_name)
            .await
        {
            error!("Test error on {} -> {}: {}", device_name, destination, e);
            result.error = e.to_string();
        }
        result.end_time = Utc::now();

        info!(
            device = device_name,
            destination,
            outcome = result.outcome.code(),
            duration_ms = (result.end_time - result.start_time).num_milliseconds(),
            "Ping run finished"
        );
        result
    }

    /// Run `repeat` pings back to back on the same session.
    pub async fn run_repeated<T: Transport>(
        &self,
        session: &mut Session<T>,
        host: &str,
        port: i64,
        destination: &str,
        device_name: &str,
        repeat: u32,
    ) -> Vec<TestResult> {
        let mut results = Vec::with_capacity(repeat as usize);
        for run in 1..=repeat {
            debug!("Ping run {}/{} on {}", run, repeat, device_name);
            results.push(
                self.run(session, host, port, destination, device_name)
                    .await,
            );
        }
        results
    }

    async fn execute<T: Transport>(
        &self,
        session: &mut Session<T>,
        result: &mut TestResult,
        destination: &str,
        device_name: &str,
    ) -> Result<(), PingError> {
        let prompt = device_prompt(device_name)?;
        let stats_pattern = statistics_pattern(destination, device_name)?;

        session
            .send_line(&format!("ping -c {} {}", self.count, destination))
            .await?;
        result.start_time = Utc::now();

        let read = session.read_until(&prompt, self.timeout).await;
        let statistics = match extract_statistics(&read.output, &stats_pattern) {
            Some(stats) => Some(stats),
            None => {
                warn!(
                    "Prompt {} did not return within {}s, aborting ping",
                    device_name,
                    self.timeout.as_secs()
                );
                session.send_interrupt().await?;
                sleep(self.abort_settle).await;
                let tail = session.drain().await;
                let combined = format!("{}{}", read.output, tail);
                let stats = extract_statistics(&combined, &stats_pattern);
                if stats.is_none() {
                    debug!(tail = %log_snippet(&combined, 300), "No statistics after abort");
                }
                stats
            }
        };

        match statistics {
            Some(stats) => {
                result.outcome = classify_statistics(&stats)?;
                result.statistics = stats;
            }
            None => result.error = STATISTICS_NOT_FOUND.to_string(),
        }
        Ok(())
    }
}
