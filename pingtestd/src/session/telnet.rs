//! Direct Telnet transport.
//!
//! Option negotiation is kept to the minimum a device CLI needs: IAC
//! sequences never reach the caller, the server may echo and suppress
//! go-ahead, every other option is refused.

use super::Transport;
use pingtest_common::SessionError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

const READ_BUFFER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Incremental IAC parser; state survives chunk boundaries.
#[derive(Debug)]
pub struct TelnetCodec {
    state: State,
}

impl Default for TelnetCodec {
    fn default() -> Self {
        Self { state: State::Data }
    }
}

impl TelnetCodec {
    /// Split raw bytes into terminal data and negotiation replies.
    pub fn decode(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(input.len());
        let mut replies = Vec::new();

        for &byte in input {
            self.state = match self.state {
                State::Data if byte == IAC => State::Iac,
                State::Data => {
                    data.push(byte);
                    State::Data
                }
                State::Iac => match byte {
                    IAC => {
                        data.push(IAC);
                        State::Data
                    }
                    DO | DONT | WILL | WONT => State::Negotiate(byte),
                    SB => State::Sub,
                    _ => State::Data,
                },
                State::Negotiate(command) => {
                    if let Some(answer) = negotiate(command, byte) {
                        replies.extend_from_slice(&[IAC, answer, byte]);
                    }
                    State::Data
                }
                State::Sub if byte == IAC => State::SubIac,
                State::Sub => State::Sub,
                State::SubIac if byte == SE => State::Data,
                State::SubIac => State::Sub,
            };
        }

        (data, replies)
    }

    /// Escape literal 0xFF bytes in outgoing text.
    pub fn encode(text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len());
        for &byte in text.as_bytes() {
            out.push(byte);
            if byte == IAC {
                out.push(IAC);
            }
        }
        out
    }
}

/// Answer to a DO/WILL request; DONT/WONT are acknowledged silently.
fn negotiate(command: u8, option: u8) -> Option<u8> {
    match command {
        DO if option == OPT_SGA => Some(WILL),
        DO => Some(WONT),
        WILL if option == OPT_ECHO || option == OPT_SGA => Some(DO),
        WILL => Some(DONT),
        _ => None,
    }
}

/// Raw TCP Telnet connection to the device.
pub struct TelnetTransport {
    stream: TcpStream,
    codec: TelnetCodec,
    target: String,
}

impl TelnetTransport {
    /// Open one TCP connection, bounded by `connect_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let target = format!("{host}:{port}");
        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SessionError::Timeout {
                target: target.clone(),
                secs: connect_timeout.as_secs(),
            })?
            .map_err(|e| SessionError::Connect {
                target: target.clone(),
                reason: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY on {}: {}", target, e);
        }
        debug!("Telnet connected to {}", target);
        Ok(Self {
            stream,
            codec: TelnetCodec::default(),
            target,
        })
    }
}

impl Transport for TelnetTransport {
    async fn send(&mut self, data: &str) -> Result<(), SessionError> {
        self.stream.write_all(&TelnetCodec::encode(data)).await?;
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        let mut buf = [0u8; READ_BUFFER];
        let n = match timeout(wait, self.stream.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => return Ok(None),
        };
        if n == 0 {
            return Err(SessionError::Closed);
        }

        let (data, replies) = self.codec.decode(&buf[..n]);
        if !replies.is_empty() {
            self.stream.write_all(&replies).await?;
        }
        Ok(Some(data))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.stream.shutdown().await?;
        debug!("Telnet connection to {} closed", self.target);
        Ok(())
    }

    fn login_preamble(&self, _host: &str, _port: u16) -> Option<String> {
        None
    }

    fn newline(&self) -> &'static str {
        "\r\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passes_through() {
        let mut codec = TelnetCodec::default();
        let (data, replies) = codec.decode(b"Username: ");
        assert_eq!(data, b"Username: ");
        assert!(replies.is_empty());
    }

    #[test]
    fn test_negotiation_is_stripped_and_answered() {
        let mut codec = TelnetCodec::default();
        let input = [
            IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SGA, IAC, DO, 24, b'O', b'K', IAC, WILL, 31,
        ];
        let (data, replies) = codec.decode(&input);
        assert_eq!(data, b"OK");
        assert_eq!(
            replies,
            vec![IAC, DO, OPT_ECHO, IAC, DO, OPT_SGA, IAC, WONT, 24, IAC, DONT, 31]
        );
    }

    #[test]
    fn test_sequence_split_across_chunks() {
        let mut codec = TelnetCodec::default();
        let (first, replies) = codec.decode(&[b'a', IAC]);
        assert_eq!(first, b"a");
        assert!(replies.is_empty());
        let (second, replies) = codec.decode(&[DO, OPT_SGA, b'b']);
        assert_eq!(second, b"b");
        assert_eq!(replies, vec![IAC, WILL, OPT_SGA]);
    }

    #[test]
    fn test_subnegotiation_is_discarded() {
        let mut codec = TelnetCodec::default();
        let input = [b'x', IAC, SB, 24, 1, IAC, SE, b'y'];
        let (data, replies) = codec.decode(&input);
        assert_eq!(data, b"xy");
        assert!(replies.is_empty());
    }

    #[test]
    fn test_escaped_iac_is_data() {
        let mut codec = TelnetCodec::default();
        let (data, _) = codec.decode(&[IAC, IAC]);
        assert_eq!(data, vec![IAC]);
        assert_eq!(TelnetCodec::encode("ping\r\n"), b"ping\r\n".to_vec());
    }

    #[test]
    fn test_refusals_are_not_answered() {
        let mut codec = TelnetCodec::default();
        let (_, replies) = codec.decode(&[IAC, DONT, OPT_ECHO, IAC, WONT, OPT_SGA]);
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn test_connect_and_exchange_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut banner = vec![IAC, WILL, OPT_ECHO];
            banner.extend_from_slice(b"Username:");
            socket.write_all(&banner).await.unwrap();
            let mut buf = vec![0u8; 64];
            let mut received = Vec::new();
            while !received.ends_with(b"\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        let mut transport = TelnetTransport::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        let mut output = Vec::new();
        while !output.ends_with(b"Username:") {
            if let Some(chunk) = transport.recv(Duration::from_secs(5)).await.unwrap() {
                output.extend_from_slice(&chunk);
            }
        }
        transport.send("admin\r\n").await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(&received[..3], &[IAC, DO, OPT_ECHO]);
        assert!(received.ends_with(b"admin\r\n"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TelnetTransport::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Connect { .. }));
    }
}
