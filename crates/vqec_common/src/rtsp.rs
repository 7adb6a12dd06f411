//! Minimal blocking RTSP client for fetching resources with DESCRIBE.
//!
//! Every socket operation is bounded by the caller's absolute deadline. The
//! client keeps a single response buffer and is not meant to be shared
//! between threads.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv6Addr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Largest response body accepted
pub const MAX_BODY_LEN: usize = 1024 * 1024;

const MAX_HEADER_LEN: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum RtspError {
    #[error("deadline expired")]
    Timeout,

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("connection failed: {0}")]
    Connect(io::Error),

    #[error("not connected")]
    NotConnected,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("response body of {0} bytes exceeds limit")]
    BodyTooLarge(usize),
}

/// Address of a candidate server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` as used in URLs, with IPv6 literals bracketed
    pub fn authority(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Parsed RTSP response
#[derive(Debug, Clone, PartialEq)]
pub struct RtspResponse {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The server identification header
    pub fn server(&self) -> Option<&str> {
        self.header("Server")
    }
}

/// Session-level operations the resource fetcher needs
pub trait RtspConnector: Send {
    fn connect(&mut self, server: &ServerAddr, deadline: Instant) -> Result<(), RtspError>;

    /// Send DESCRIBE for `path` and wait for the response
    fn describe(
        &mut self,
        path: &str,
        accept: &str,
        deadline: Instant,
    ) -> Result<RtspResponse, RtspError>;

    fn close(&mut self);
}

/// TCP implementation of [`RtspConnector`]
pub struct RtspClient {
    stream: Option<TcpStream>,
    server: Option<ServerAddr>,
    cseq: u32,
    user_agent: String,
}

impl RtspClient {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            stream: None,
            server: None,
            cseq: 0,
            user_agent: user_agent.into(),
        }
    }

    fn read_response(stream: &mut TcpStream, deadline: Instant) -> Result<RtspResponse, RtspError> {
        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(response) = parse_response(&buf)? {
                return Ok(response);
            }
            stream.set_read_timeout(Some(remaining(deadline)?))?;
            let n = match stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(RtspError::Timeout)
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(RtspError::Malformed(
                    "connection closed before response completed".to_string(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl RtspConnector for RtspClient {
    fn connect(&mut self, server: &ServerAddr, deadline: Instant) -> Result<(), RtspError> {
        self.close();
        let addrs = (server.host.as_str(), server.port)
            .to_socket_addrs()
            .map_err(|_| RtspError::Resolve(server.to_string()))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, remaining(deadline)?) {
                Ok(stream) => {
                    debug!("Connected to {} ({})", server, addr);
                    self.stream = Some(stream);
                    self.server = Some(server.clone());
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => RtspError::Connect(e),
            None => RtspError::Resolve(server.to_string()),
        })
    }

    fn describe(
        &mut self,
        path: &str,
        accept: &str,
        deadline: Instant,
    ) -> Result<RtspResponse, RtspError> {
        let server = self.server.clone().ok_or(RtspError::NotConnected)?;
        let stream = self.stream.as_mut().ok_or(RtspError::NotConnected)?;
        self.cseq += 1;

        let request = format!(
            "DESCRIBE rtsp://{}/{} RTSP/1.0\r\nCSeq: {}\r\nAccept: {}\r\nUser-Agent: {}\r\n\r\n",
            server.authority(),
            path,
            self.cseq,
            accept,
            self.user_agent
        );
        stream.set_write_timeout(Some(remaining(deadline)?))?;
        stream.write_all(request.as_bytes())?;

        Self::read_response(stream, deadline)
    }

    fn close(&mut self) {
        self.stream = None;
        self.server = None;
    }
}

fn remaining(deadline: Instant) -> Result<Duration, RtspError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(RtspError::Timeout)
    } else {
        Ok(left)
    }
}

/// Parse a response from `buf`; `Ok(None)` when more bytes are needed.
pub fn parse_response(buf: &[u8]) -> Result<Option<RtspResponse>, RtspError> {
    let header_end = match buf.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => pos,
        None if buf.len() > MAX_HEADER_LEN => {
            return Err(RtspError::Malformed("header section too long".to_string()))
        }
        None => return Ok(None),
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| RtspError::Malformed("header is not UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("RTSP/") {
        return Err(RtspError::Malformed(format!("bad status line '{}'", status_line)));
    }
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| RtspError::Malformed(format!("bad status code in '{}'", status_line)))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, value)| {
            value
                .parse::<usize>()
                .map_err(|_| RtspError::Malformed(format!("bad Content-Length '{}'", value)))
        })
        .transpose()?
        .unwrap_or(0);
    if content_length > MAX_BODY_LEN {
        return Err(RtspError::BodyTooLarge(content_length));
    }

    let body_start = header_end + 4;
    if buf.len() < body_start + content_length {
        return Ok(None);
    }

    Ok(Some(RtspResponse {
        code,
        reason,
        headers,
        body: buf[body_start..body_start + content_length].to_vec(),
    }))
}
