//! Interactive terminal sessions to network devices.
//!
//! A [`Transport`] moves raw bytes; a [`Session`] layers the CLI
//! conversation on top: line sending, pattern-bounded reads, the fixed
//! username/password/prompt login and best-effort teardown.

pub mod ssh;
pub mod telnet;

#[cfg(test)]
pub mod scripted;

use pingtest_common::config::{Backend, PingtestConfig, SshConfig, TelnetConfig};
use pingtest_common::util::log_snippet;
use pingtest_common::{RetryPolicy, SessionError, run_with_retry};
use regex::Regex;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

pub use ssh::SshTransport;
pub use telnet::TelnetTransport;

static USERNAME_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)username:").expect("username prompt regex is valid"));

static PASSWORD_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)password:").expect("password prompt regex is valid"));

/// Pause between `exit` and closing the transport.
const CLOSE_SETTLE: Duration = Duration::from_millis(500);

/// Byte-level channel to a device CLI.
pub trait Transport: Send {
    /// Write text to the remote side as-is.
    fn send(&mut self, data: &str) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Next chunk of output, waiting at most `wait`.
    ///
    /// `Ok(None)` means nothing arrived in time; a zero wait only returns
    /// data that is already buffered.
    fn recv(
        &mut self,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, SessionError>> + Send;

    /// Close the channel and the underlying connection.
    fn close(&mut self) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Command that opens the device CLI from this transport, if one is needed.
    fn login_preamble(&self, host: &str, port: u16) -> Option<String>;

    /// Line terminator expected by the remote side.
    fn newline(&self) -> &'static str {
        "\n"
    }
}

/// Opens transports; the engine is generic over this so tests can script devices.
pub trait Connector: Send + Sync {
    type Transport: Transport;

    /// Open a transport for the device at `host:port`.
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Transport, SessionError>> + Send;
}

/// What a pattern-bounded read produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    pub output: String,
    pub matched: bool,
}

/// Per-step waits of the login sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginTimeouts {
    pub username: Duration,
    pub password: Duration,
    pub prompt: Duration,
}

impl Default for LoginTimeouts {
    fn default() -> Self {
        Self {
            username: Duration::from_secs(30),
            password: Duration::from_secs(30),
            prompt: Duration::from_secs(40),
        }
    }
}

/// Regex matching the `<device_name>` CLI prompt.
pub fn device_prompt(device_name: &str) -> Result<Regex, SessionError> {
    Regex::new(&format!("<{}>", regex::escape(device_name)))
        .map_err(|e| SessionError::Pattern(e.to_string()))
}

/// A CLI conversation over a transport.
pub struct Session<T> {
    transport: T,
    /// Human-readable description of the device, for logs.
    target: String,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, target: impl Into<String>) -> Self {
        Self {
            transport,
            target: target.into(),
        }
    }

    /// Send one line terminated the way the transport expects.
    pub async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        let data = format!("{line}{}", self.transport.newline());
        self.transport.send(&data).await
    }

    /// Send Ctrl-C followed by a line terminator.
    pub async fn send_interrupt(&mut self) -> Result<(), SessionError> {
        let data = format!("\x03{}", self.transport.newline());
        self.transport.send(&data).await
    }

    /// Accumulate output until `pattern` matches or `timeout` elapses.
    ///
    /// Never fails: on timeout the accumulated text is returned after one
    /// final non-blocking drain, and a transport error ends the read early
    /// with whatever arrived before it.
    pub async fn read_until(&mut self, pattern: &Regex, timeout: Duration) -> ReadOutcome {
        let deadline = Instant::now() + timeout;
        let mut output = String::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.transport.recv(remaining).await {
                Ok(Some(chunk)) => {
                    output.push_str(&String::from_utf8_lossy(&chunk));
                    if pattern.is_match(&output) {
                        return ReadOutcome {
                            output,
                            matched: true,
                        };
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Read from {} ended early: {}", self.target, e);
                    let matched = pattern.is_match(&output);
                    return ReadOutcome { output, matched };
                }
            }
        }

        output.push_str(&self.drain().await);
        let matched = pattern.is_match(&output);
        if !matched {
            debug!(
                target_device = %self.target,
                pattern = pattern.as_str(),
                timeout_secs = timeout.as_secs_f64(),
                tail = %log_snippet(&output, 200),
                "Timed out waiting for pattern"
            );
        }
        ReadOutcome { output, matched }
    }

    /// Collect whatever is already buffered without waiting.
    pub async fn drain(&mut self) -> String {
        let mut output = String::new();
        loop {
            match self.transport.recv(Duration::ZERO).await {
                Ok(Some(chunk)) => output.push_str(&String::from_utf8_lossy(&chunk)),
                Ok(None) => break,
                Err(e) => {
                    debug!("Drain from {} stopped: {}", self.target, e);
                    break;
                }
            }
        }
        output
    }

    /// Log in to the device CLI and return the transcript of the three reads.
    ///
    /// Prompts that never show up are logged, not treated as errors; the
    /// following step is attempted anyway. Only send failures abort.
    pub async fn login(
        &mut self,
        host: &str,
        port: u16,
        device_name: &str,
        credentials: &TelnetConfig,
        timeouts: &LoginTimeouts,
    ) -> Result<String, SessionError> {
        let prompt = device_prompt(device_name)?;
        let mut transcript = String::new();

        if let Some(command) = self.transport.login_preamble(host, port) {
            self.send_line(&command).await?;
        }
        let step = self.read_until(&USERNAME_PROMPT, timeouts.username).await;
        if !step.matched {
            warn!("No username prompt from {} ({}:{})", device_name, host, port);
        }
        transcript.push_str(&step.output);

        self.send_line(&credentials.user).await?;
        let step = self.read_until(&PASSWORD_PROMPT, timeouts.password).await;
        if !step.matched {
            warn!("No password prompt from {} ({}:{})", device_name, host, port);
        }
        transcript.push_str(&step.output);

        self.send_line(&credentials.password).await?;
        let step = self.read_until(&prompt, timeouts.prompt).await;
        if step.matched {
            info!("Logged in to {} ({}:{})", device_name, host, port);
        } else {
            warn!("Device prompt {} not seen after login", device_name);
        }
        transcript.push_str(&step.output);

        Ok(transcript)
    }

    /// Leave the CLI and close the transport, swallowing every failure.
    pub async fn close(mut self) {
        if let Err(e) = self.send_line("exit").await {
            debug!("Sending exit to {} failed: {}", self.target, e);
        }
        sleep(CLOSE_SETTLE).await;
        if let Err(e) = self.transport.close().await {
            debug!("Closing session to {} failed: {}", self.target, e);
        }
    }
}

/// Either backend behind one type.
pub enum DeviceTransport {
    Ssh(SshTransport),
    Telnet(TelnetTransport),
}

impl Transport for DeviceTransport {
    async fn send(&mut self, data: &str) -> Result<(), SessionError> {
        match self {
            Self::Ssh(t) => t.send(data).await,
            Self::Telnet(t) => t.send(data).await,
        }
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        match self {
            Self::Ssh(t) => t.recv(wait).await,
            Self::Telnet(t) => t.recv(wait).await,
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        match self {
            Self::Ssh(t) => t.close().await,
            Self::Telnet(t) => t.close().await,
        }
    }

    fn login_preamble(&self, host: &str, port: u16) -> Option<String> {
        match self {
            Self::Ssh(t) => t.login_preamble(host, port),
            Self::Telnet(t) => t.login_preamble(host, port),
        }
    }

    fn newline(&self) -> &'static str {
        match self {
            Self::Ssh(t) => t.newline(),
            Self::Telnet(t) => t.newline(),
        }
    }
}

/// Production connector selected by [`Backend`].
#[derive(Debug, Clone)]
pub struct BackendConnector {
    backend: Backend,
    ssh: Option<SshConfig>,
    telnet_timeout: Duration,
    retry: RetryPolicy,
}

impl BackendConnector {
    pub fn from_config(config: &PingtestConfig) -> Self {
        Self {
            backend: config.backend,
            ssh: config.ssh.clone(),
            telnet_timeout: config.telnet.timeout,
            retry: RetryPolicy::connection(),
        }
    }
}

impl Connector for BackendConnector {
    type Transport = DeviceTransport;

    async fn connect(&self, host: &str, port: u16) -> Result<DeviceTransport, SessionError> {
        match self.backend {
            Backend::SshTunnel => {
                let ssh = self.ssh.as_ref().ok_or_else(|| SessionError::Connect {
                    target: format!("{host}:{port}"),
                    reason: "ssh backend selected but no jump host configured".to_string(),
                })?;
                let target = format!("{}:{}", ssh.host, ssh.port);
                let transport = run_with_retry(&format!("ssh connect {target}"), &self.retry, || {
                    SshTransport::connect(ssh)
                })
                .await?;
                Ok(DeviceTransport::Ssh(transport))
            }
            Backend::Telnet => {
                let target = format!("{host}:{port}");
                let transport =
                    run_with_retry(&format!("telnet connect {target}"), &self.retry, || {
                        TelnetTransport::connect(host, port, self.telnet_timeout)
                    })
                    .await?;
                Ok(DeviceTransport::Telnet(transport))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedTransport;
    use super::*;

    fn credentials() -> TelnetConfig {
        TelnetConfig {
            user: "admin".into(),
            password: "device-pass".into(),
            timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_until_returns_on_match() {
        let transport = ScriptedTransport::new().with_banner(["Hello\n", "<R1>"]);
        let mut session = Session::new(transport, "R1");
        let prompt = device_prompt("R1").unwrap();

        let outcome = session.read_until(&prompt, Duration::from_secs(5)).await;
        assert!(outcome.matched);
        assert_eq!(outcome.output, "Hello\n<R1>");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_until_timeout_returns_accumulated_text() {
        let transport = ScriptedTransport::new().with_banner(["partial output"]);
        let mut session = Session::new(transport, "R1");
        let prompt = device_prompt("R1").unwrap();

        let started = Instant::now();
        let outcome = session.read_until(&prompt, Duration::from_secs(5)).await;
        assert!(!outcome.matched);
        assert_eq!(outcome.output, "partial output");
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_until_stops_when_transport_closes() {
        let transport = ScriptedTransport::new()
            .with_banner(["Connection closed by foreign host."])
            .closing_when_drained();
        let mut session = Session::new(transport, "R1");
        let prompt = device_prompt("R1").unwrap();

        let started = Instant::now();
        let outcome = session.read_until(&prompt, Duration::from_secs(30)).await;
        assert!(!outcome.matched);
        assert_eq!(outcome.output, "Connection closed by foreign host.");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_over_ssh_tunnel_sends_telnet_first() {
        let transport = ScriptedTransport::new()
            .tunnelled()
            .on("telnet 192.0.2.10 23", ["Trying...\r\nUsername: "])
            .on("admin", ["Password: "])
            .on("device-pass", ["\r\n<R1>"]);
        let sent = transport.sent_log();
        let mut session = Session::new(transport, "R1");

        let transcript = session
            .login("192.0.2.10", 23, "R1", &credentials(), &LoginTimeouts::default())
            .await
            .unwrap();

        assert_eq!(transcript, "Trying...\r\nUsername: Password: \r\n<R1>");
        assert_eq!(
            *sent.lock().unwrap(),
            vec!["telnet 192.0.2.10 23\n", "admin\n", "device-pass\n"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_on_raw_telnet_skips_preamble() {
        let transport = ScriptedTransport::new()
            .with_banner(["User Access Verification\r\nUsername: "])
            .on("admin", ["Password: "])
            .on("device-pass", ["<R1>"]);
        let sent = transport.sent_log();
        let mut session = Session::new(transport, "R1");

        session
            .login("192.0.2.10", 23, "R1", &credentials(), &LoginTimeouts::default())
            .await
            .unwrap();

        assert_eq!(*sent.lock().unwrap(), vec!["admin\n", "device-pass\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_tolerates_missing_password_prompt() {
        let transport = ScriptedTransport::new()
            .tunnelled()
            .on("telnet 192.0.2.10 23", ["Username: "])
            .on("admin", ["% Login invalid\r\n"]);
        let mut session = Session::new(transport, "R1");

        let started = Instant::now();
        let transcript = session
            .login("192.0.2.10", 23, "R1", &credentials(), &LoginTimeouts::default())
            .await
            .unwrap();

        assert_eq!(transcript, "Username: % Login invalid\r\n");
        assert!(started.elapsed() >= Duration::from_secs(70));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_propagates_send_failure() {
        let transport = ScriptedTransport::new().tunnelled().failing_sends();
        let mut session = Session::new(transport, "R1");

        let err = session
            .login("192.0.2.10", 23, "R1", &credentials(), &LoginTimeouts::default())
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_sends_exit_and_swallows_errors() {
        let transport = ScriptedTransport::new();
        let sent = transport.sent_log();
        let closed = transport.closed_flag();
        Session::new(transport, "R1").close().await;
        assert_eq!(*sent.lock().unwrap(), vec!["exit\n"]);
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));

        let broken = ScriptedTransport::new().failing_sends();
        Session::new(broken, "R1").close().await;
    }

    #[test]
    fn test_device_prompt_escapes_metacharacters() {
        let prompt = device_prompt("core.sw(1)").unwrap();
        assert!(prompt.is_match("<core.sw(1)>"));
        assert!(!prompt.is_match("<coreXsw(1)>"));
        assert!(!prompt.is_match("core.sw(1)#"));
    }
}
