/**
 * PROBE - MQTT 3.1.1 handshake fingerprinting
 *
 * ROLE: tells whether a TCP endpoint speaks MQTT and whether it lets anonymous
 * clients in, by sending a hand-built CONNECT and reading the CONNACK code.
 *
 * HOW: the whole exchange runs under one deadline. Socket errors and timeouts
 * fold into `responsive = false`; the probe itself never fails.
 */

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const DISCONNECT: [u8; 2] = [0xE0, 0x00];
const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 0x04;
const CLEAN_SESSION: u8 = 0x02;
const KEEP_ALIVE_SECS: u16 = 60;
const READ_LIMIT: usize = 64;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5000);

/// `NetworkScanner` followed by 8 hex characters.
pub fn scanner_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("NetworkScanner{}", &id[..8])
}

/// CONNECT frame with clean session, 60 s keep-alive, no credentials.
pub fn connect_frame(client_id: &str) -> Vec<u8> {
    let id = &client_id.as_bytes()[..client_id.len().min(u16::MAX as usize)];
    // variable header (10) + client id length prefix (2) + client id
    let remaining = 10 + 2 + id.len();

    let mut frame = Vec::with_capacity(remaining + 5);
    frame.push(CONNECT);
    put_remaining_length(remaining, &mut frame);
    frame.extend_from_slice(&(PROTOCOL_NAME.len() as u16).to_be_bytes());
    frame.extend_from_slice(PROTOCOL_NAME);
    frame.push(PROTOCOL_LEVEL);
    frame.push(CLEAN_SESSION);
    frame.extend_from_slice(&KEEP_ALIVE_SECS.to_be_bytes());
    frame.extend_from_slice(&(id.len() as u16).to_be_bytes());
    frame.extend_from_slice(id);
    frame
}

fn put_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Return code of a CONNACK, if `data` starts with one.
pub fn parse_connack(data: &[u8]) -> Option<u8> {
    if data.len() >= 4 && data[0] == CONNACK {
        Some(data[3])
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthRequirement {
    #[default]
    Unknown,
    No,
    Yes,
}

impl AuthRequirement {
    pub fn from_ack(code: u8) -> Self {
        match code {
            0 => AuthRequirement::No,
            4 | 5 => AuthRequirement::Yes,
            _ => AuthRequirement::Unknown,
        }
    }
}

pub fn ack_reason(code: u8) -> &'static str {
    match code {
        0 => "connection accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad username or password",
        5 => "not authorized",
        _ => "connection refused",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub host: String,
    pub port: u16,
    pub responsive: bool,
    pub protocol_detected: bool,
    pub auth_required: AuthRequirement,
    pub ack_code: Option<u8>,
    pub response_time_ms: u64,
}

impl ProbeResult {
    fn unresponsive(host: &str, port: u16, elapsed: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            responsive: false,
            protocol_detected: false,
            auth_required: AuthRequirement::Unknown,
            ack_code: None,
            response_time_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn ack_reason(&self) -> Option<&'static str> {
        self.ack_code.map(ack_reason)
    }
}

/// How far a probe got; the sweep counts each outcome separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeAttempt {
    Refused,
    TimedOut,
    /// TCP connect succeeded; the handshake may still have failed.
    Completed(ProbeResult),
}

#[derive(Debug, Clone)]
pub struct HandshakeProbe {
    timeout: Duration,
}

impl Default for HandshakeProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl HandshakeProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn probe(&self, host: &str, port: u16) -> ProbeResult {
        let started = Instant::now();
        match self.attempt(host, port).await {
            ProbeAttempt::Completed(result) => result,
            ProbeAttempt::Refused | ProbeAttempt::TimedOut => {
                ProbeResult::unresponsive(host, port, started.elapsed())
            }
        }
    }

    pub async fn attempt(&self, host: &str, port: u16) -> ProbeAttempt {
        let started = Instant::now();
        let stream = match timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "probe connect failed");
                return ProbeAttempt::Refused;
            }
            Err(_) => {
                debug!(host, port, "probe connect timed out");
                return ProbeAttempt::TimedOut;
            }
        };
        ProbeAttempt::Completed(self.probe_stream(host, port, stream, started).await)
    }

    /// Runs the handshake on an already connected stream.
    pub async fn probe_stream<S>(&self, host: &str, port: u16, mut stream: S, started: Instant) -> ProbeResult
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let client_id = scanner_client_id();
        let outcome = timeout(self.timeout, handshake(&mut stream, &client_id)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(Some(code))) => {
                debug!(host, port, code, reason = ack_reason(code), "CONNACK received");
                ProbeResult {
                    host: host.to_string(),
                    port,
                    responsive: true,
                    protocol_detected: true,
                    auth_required: AuthRequirement::from_ack(code),
                    ack_code: Some(code),
                    response_time_ms: elapsed.as_millis() as u64,
                }
            }
            Ok(Ok(None)) => ProbeResult {
                responsive: true,
                ..ProbeResult::unresponsive(host, port, elapsed)
            },
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "handshake failed");
                ProbeResult::unresponsive(host, port, elapsed)
            }
            Err(_) => {
                debug!(host, port, "handshake timed out");
                ProbeResult::unresponsive(host, port, elapsed)
            }
        }
    }
}

async fn handshake<S>(stream: &mut S, client_id: &str) -> std::io::Result<Option<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&connect_frame(client_id)).await?;

    let mut buf = [0u8; READ_LIMIT];
    let mut filled = 0;
    while filled < 4 {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let code = parse_connack(&buf[..filled]);
    if code == Some(0) {
        if let Err(e) = stream.write_all(&DISCONNECT).await {
            debug!(error = %e, "DISCONNECT not delivered");
        }
    }
    stream.shutdown().await.ok();
    Ok(code)
}
