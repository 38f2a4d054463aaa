//! Test execution engine.
//!
//! Turns a scenario into exactly one [`TestResult`]: validate, connect,
//! log in, ping once, tear down. Every failure along the way becomes an FT
//! result; nothing is returned as an error.

use crate::ping::PingDriver;
use crate::session::{Connector, LoginTimeouts, Session};
use pingtest_common::config::TelnetConfig;
use pingtest_common::{ERROR_MAX_CHARS, ScenarioArgs, SessionError, TestResult, truncate_chars};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Executes scenarios against devices reached through `C`.
pub struct TestEngine<C> {
    connector: C,
    credentials: TelnetConfig,
    login_timeouts: LoginTimeouts,
    driver: PingDriver,
}

impl<C: Connector> TestEngine<C> {
    pub fn new(connector: C, credentials: TelnetConfig) -> Self {
        Self {
            connector,
            credentials,
            login_timeouts: LoginTimeouts::default(),
            driver: PingDriver::default(),
        }
    }

    /// Execute from positional job arguments.
    pub async fn execute_args(&self, args: &[Value]) -> TestResult {
        match ScenarioArgs::from_args(args) {
            Ok(scenario) => self.execute(&scenario).await,
            Err(e) => {
                warn!("Rejected job arguments {:?}: {}", args, e);
                TestResult::failure(e, args)
            }
        }
    }

    /// Execute one scenario; never fails.
    pub async fn execute(&self, scenario: &ScenarioArgs) -> TestResult {
        let port = match scenario.validate().and_then(|()| scenario.port_u16()) {
            Ok(port) => port,
            Err(e) => {
                warn!("Invalid scenario {}: {}", scenario, e);
                return TestResult::failure(e, &scenario.to_args());
            }
        };

        info!("Executing test {}", scenario);
        match self.run_session(scenario, port).await {
            Ok(results) => match results.into_iter().next() {
                Some(mut result) => {
                    result.test_name = Some(scenario.test_name.clone());
                    result.error = truncate_chars(&result.error, ERROR_MAX_CHARS);
                    result
                }
                None => TestResult::failure("No results returned from ping test", &scenario.to_args()),
            },
            Err(e) => {
                error!("Test {} failed: {}", scenario, e);
                TestResult::failure(e, &scenario.to_args())
            }
        }
    }

    async fn run_session(
        &self,
        scenario: &ScenarioArgs,
        port: u16,
    ) -> Result<Vec<TestResult>, SessionError> {
        let transport = self.connector.connect(&scenario.host, port).await?;
        let mut session = Session::new(transport, scenario.to_string());

        let outcome = match session
            .login(
                &scenario.host,
                port,
                &scenario.device_name,
                &self.credentials,
                &self.login_timeouts,
            )
            .await
        {
            Ok(transcript) => {
                debug!(
                    "Login transcript for {}: {} chars",
                    scenario.device_name,
                    transcript.len()
                );
                Ok(self
                    .driver
                    .run_repeated(
                        &mut session,
                        &scenario.host,
                        scenario.port,
                        &scenario.destination,
                        &scenario.device_name,
                        1,
                    )
                    .await)
            }
            Err(e) => Err(e),
        };

        session.close().await;
        outcome
    }
}
