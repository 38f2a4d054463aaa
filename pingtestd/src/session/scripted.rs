//! In-memory device used by tests in place of SSH/Telnet.
//!
//! Replies are triggered by the exact line sent; each trigger fires once,
//! so the same command can be scripted to answer differently on repeat.

use super::{Connector, Transport};
use pingtest_common::SessionError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    pending: VecDeque<Vec<u8>>,
    rules: Vec<(String, Vec<String>)>,
    tunnelled: bool,
    close_when_drained: bool,
    fail_sends: bool,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output available before anything is sent.
    pub fn with_banner<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pending
            .extend(chunks.into_iter().map(|c| c.into().into_bytes()));
        self
    }

    /// Queue `replies` the first time `line` is sent.
    pub fn on<I, S>(mut self, line: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push((
            line.to_string(),
            replies.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Behave like the SSH jump host: login starts with `telnet <host> <port>`.
    pub fn tunnelled(mut self) -> Self {
        self.tunnelled = true;
        self
    }

    /// Report the connection as closed once queued output runs out.
    pub fn closing_when_drained(mut self) -> Self {
        self.close_when_drained = true;
        self
    }

    /// Every send fails with [`SessionError::Closed`].
    pub fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    /// Everything sent so far, line terminators included.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.sent.clone()
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl Transport for ScriptedTransport {
    async fn send(&mut self, data: &str) -> Result<(), SessionError> {
        if self.fail_sends {
            return Err(SessionError::Closed);
        }
        self.sent.lock().unwrap().push(data.to_string());
        let line = data.trim_end_matches(['\r', '\n']);
        if let Some(index) = self.rules.iter().position(|(trigger, _)| trigger == line) {
            let (_, replies) = self.rules.remove(index);
            self.pending
                .extend(replies.into_iter().map(String::into_bytes));
        }
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        if let Some(chunk) = self.pending.pop_front() {
            return Ok(Some(chunk));
        }
        if self.close_when_drained {
            return Err(SessionError::Closed);
        }
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn login_preamble(&self, host: &str, port: u16) -> Option<String> {
        self.tunnelled.then(|| format!("telnet {host} {port}"))
    }
}

/// Jump host that logs in to `<R1>` at 192.0.2.10:23 and answers one
/// `ping -c 1000 10.0.0.2` with `loss` packet loss.
pub fn r1_device(loss: &str) -> ScriptedTransport {
    ScriptedTransport::new()
        .tunnelled()
        .on("telnet 192.0.2.10 23", ["Trying 192.0.2.10...\r\nUsername:"])
        .on("admin", ["Password:"])
        .on("device-pass", ["\r\n<R1>"])
        .on(
            "ping -c 1000 10.0.0.2",
            [format!(
                "--- 10.0.0.2 ping statistics ---\n1000 packets transmitted, 1000 received, {loss} packet loss\n<R1>"
            )],
        )
}

/// Hands out clones of one scripted device, optionally failing first.
#[derive(Clone)]
pub struct ScriptedConnector {
    device: ScriptedTransport,
    failures_before_success: u32,
    attempts: Arc<AtomicU32>,
}

impl ScriptedConnector {
    pub fn new(device: ScriptedTransport) -> Self {
        Self {
            device,
            failures_before_success: 0,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Refuse every connection.
    pub fn unreachable() -> Self {
        Self {
            failures_before_success: u32::MAX,
            ..Self::new(ScriptedTransport::new())
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self, host: &str, port: u16) -> Result<ScriptedTransport, SessionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures_before_success {
            return Err(SessionError::Connect {
                target: format!("{host}:{port}"),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.device.clone())
    }
}
