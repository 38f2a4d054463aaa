//! SSH jump-host transport built on `russh`.
//!
//! Password login to the jump host, PTY plus interactive shell, and the
//! device is then reached with `telnet <host> <port>` typed into that shell.

use super::Transport;
use pingtest_common::SessionError;
use pingtest_common::config::SshConfig;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

/// Time the remote shell gets to print its banner before the first command.
const SHELL_SETTLE: Duration = Duration::from_secs(2);

const PTY_COLUMNS: u32 = 200;
const PTY_ROWS: u32 = 50;

/// Command typed into the jump host shell to reach the device.
fn tunnel_command(host: &str, port: u16) -> String {
    format!("telnet {host} {port}")
}

/// A rejected password is an authentication error, not a connect failure.
fn check_auth(accepted: bool, target: &str, user: &str) -> Result<(), SessionError> {
    if accepted {
        Ok(())
    } else {
        Err(SessionError::Auth {
            target: target.to_string(),
            user: user.to_string(),
        })
    }
}

/// Accepts any host key; jump hosts are addressed by configuration only.
struct JumpHostHandler;

impl client::Handler for JumpHostHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Interactive shell on the jump host.
pub struct SshTransport {
    handle: Handle<JumpHostHandler>,
    channel: Channel<Msg>,
    target: String,
}

impl SshTransport {
    /// Connect, authenticate and open a shell; one attempt, bounded by the
    /// configured timeout.
    pub async fn connect(config: &SshConfig) -> Result<Self, SessionError> {
        let target = format!("{}:{}", config.host, config.port);
        let secs = config.timeout.as_secs();

        let transport = timeout(config.timeout, Self::open(config, target.clone()))
            .await
            .map_err(|_| SessionError::Timeout {
                target: target.clone(),
                secs,
            })??;

        sleep(SHELL_SETTLE).await;
        info!("SSH shell open on {}", target);
        Ok(transport)
    }

    async fn open(config: &SshConfig, target: String) -> Result<Self, SessionError> {
        let connect_error = |e: russh::Error| SessionError::Connect {
            target: target.clone(),
            reason: e.to_string(),
        };

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let mut handle = client::connect(
            ssh_config,
            (config.host.as_str(), config.port),
            JumpHostHandler,
        )
        .await
        .map_err(connect_error)?;

        let auth = handle
            .authenticate_password(config.user.as_str(), config.password.as_str())
            .await
            .map_err(connect_error)?;
        check_auth(auth.success(), &target, &config.user)?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(connect_error)?;
        channel
            .request_pty(false, "vt100", PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
            .await
            .map_err(connect_error)?;
        channel
            .request_shell(false)
            .await
            .map_err(connect_error)?;

        debug!("SSH channel ready on {}", target);
        Ok(Self {
            handle,
            channel,
            target,
        })
    }
}

impl Transport for SshTransport {
    async fn send(&mut self, data: &str) -> Result<(), SessionError> {
        self.channel
            .data(data.as_bytes())
            .await
            .map_err(|e| SessionError::Io(format!("write to {} failed: {e}", self.target)))
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        let next = timeout(wait, async {
            loop {
                match self.channel.wait().await {
                    Some(ChannelMsg::Data { data }) => return Ok(data.to_vec()),
                    Some(ChannelMsg::ExtendedData { data, .. }) => return Ok(data.to_vec()),
                    Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                        return Err(SessionError::Closed);
                    }
                    Some(_) => {}
                }
            }
        })
        .await;

        match next {
            Ok(Ok(chunk)) => Ok(Some(chunk)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if let Err(e) = self.channel.eof().await {
            debug!("SSH eof on {} failed: {}", self.target, e);
        }
        if let Err(e) = self.channel.close().await {
            debug!("SSH channel close on {} failed: {}", self.target, e);
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| SessionError::Io(format!("disconnect from {} failed: {e}", self.target)))
    }

    fn login_preamble(&self, host: &str, port: u16) -> Option<String> {
        Some(tunnel_command(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pingtest_common::RetryableError;
    use tokio::net::TcpListener;

    fn jump_config(port: u16, timeout: Duration) -> SshConfig {
        SshConfig {
            host: "127.0.0.1".into(),
            user: "netops".into(),
            password: "s3cret".into(),
            port,
            timeout,
        }
    }

    #[test]
    fn test_tunnel_command() {
        assert_eq!(tunnel_command("192.0.2.10", 23), "telnet 192.0.2.10 23");
        assert_eq!(tunnel_command("core-sw1", 2323), "telnet core-sw1 2323");
    }

    #[test]
    fn test_rejected_password_is_auth_error() {
        assert!(check_auth(true, "jump:22", "netops").is_ok());

        let err = check_auth(false, "jump:22", "netops").unwrap_err();
        assert!(matches!(
            &err,
            SessionError::Auth { target, user } if target == "jump:22" && user == "netops"
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = SshTransport::connect(&jump_config(port, Duration::from_secs(5)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Connect { .. }), "{err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = SshTransport::connect(&jump_config(port, Duration::from_millis(300)))
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, SessionError::Timeout { ref target, .. } if *target == format!("127.0.0.1:{port}")),
            "{err:?}"
        );
        drop(listener);
    }
}
