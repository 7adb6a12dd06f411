//! In-memory connector and resolver for exercising the updater offline.
//!
//! Built for unit tests and behind the `test-util` feature.

use super::ConnectorFactory;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use vqec_common::{RtspConnector, RtspError, RtspResponse, ServerAddr, SrvError, SrvResolver};

/// Canned answer to a DESCRIBE
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status {
        code: u16,
        server: Option<String>,
        body: Vec<u8>,
    },
    /// Transport failure after connecting
    Error,
}

impl Reply {
    /// 200 from a current VCDS
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::Status {
            code: 200,
            server: Some("VCDS/3.8".to_string()),
            body: body.into(),
        }
    }

    /// Empty reply with the given code and optional Server header
    pub fn status(code: u16, server: Option<&str>) -> Self {
        Self::Status {
            code,
            server: server.map(str::to_string),
            body: Vec::new(),
        }
    }
}

#[derive(Default)]
struct MockState {
    refused: HashSet<String>,
    replies: HashMap<String, Reply>,
    default_reply: Option<Reply>,
    connected: Option<ServerAddr>,
    connects: Vec<String>,
    describes: Vec<String>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable [`RtspConnector`]. Clones share their script and log.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail connections to `host`
    pub fn refuse(&self, host: &str) {
        lock(&self.state).refused.insert(host.to_string());
    }

    /// Accept connections to `host` again
    pub fn accept(&self, host: &str) {
        lock(&self.state).refused.remove(host);
    }

    /// Answer every resource without a specific reply
    pub fn reply_all(&self, reply: Reply) {
        lock(&self.state).default_reply = Some(reply);
    }

    /// Answer requests for `resource`, with or without an identity suffix
    pub fn reply_for(&self, resource: &str, reply: Reply) {
        lock(&self.state)
            .replies
            .insert(resource.to_string(), reply);
    }

    pub fn log(&self) -> MockLog {
        MockLog {
            state: Arc::clone(&self.state),
        }
    }
}

impl RtspConnector for MockConnector {
    fn connect(&mut self, server: &ServerAddr, _deadline: Instant) -> Result<(), RtspError> {
        let mut state = lock(&self.state);
        state.connects.push(server.to_string());
        if state.refused.contains(&server.host) {
            return Err(RtspError::Connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }
        state.connected = Some(server.clone());
        Ok(())
    }

    fn describe(
        &mut self,
        path: &str,
        _accept: &str,
        _deadline: Instant,
    ) -> Result<RtspResponse, RtspError> {
        let mut state = lock(&self.state);
        if state.connected.is_none() {
            return Err(RtspError::NotConnected);
        }
        state.describes.push(path.to_string());

        let resource = path.split('/').next().unwrap_or(path);
        let reply = state
            .replies
            .get(resource)
            .or(state.default_reply.as_ref())
            .cloned()
            .unwrap_or_else(|| Reply::status(404, Some("VCDS/3.8")));

        match reply {
            Reply::Status { code, server, body } => {
                let mut headers = vec![("CSeq".to_string(), "1".to_string())];
                if let Some(server) = server {
                    headers.push(("Server".to_string(), server));
                }
                Ok(RtspResponse {
                    code,
                    reason: if code == 200 { "OK" } else { "Error" }.to_string(),
                    headers,
                    body,
                })
            }
            Reply::Error => Err(RtspError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset by peer",
            ))),
        }
    }

    fn close(&mut self) {
        lock(&self.state).connected = None;
    }
}

/// Read side of a [`MockConnector`]
#[derive(Clone)]
pub struct MockLog {
    state: Arc<Mutex<MockState>>,
}

impl MockLog {
    /// Servers connected to, as `host:port`
    pub fn connects(&self) -> Vec<String> {
        lock(&self.state).connects.clone()
    }

    /// Paths requested with DESCRIBE
    pub fn describes(&self) -> Vec<String> {
        lock(&self.state).describes.clone()
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.connects.clear();
        state.describes.clear();
    }
}

/// Fixed SRV answer
pub struct MockResolver {
    answer: Result<Vec<ServerAddr>, SrvError>,
}

impl MockResolver {
    pub fn with(servers: Vec<ServerAddr>) -> Self {
        Self {
            answer: Ok(servers),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: Err(SrvError::NoRecords("_rtsp._tcp.example.net".to_string())),
        }
    }
}

impl SrvResolver for MockResolver {
    fn lookup_srv(
        &self,
        _domain: &str,
        _service: &str,
        _protocol: &str,
    ) -> Result<Vec<ServerAddr>, SrvError> {
        match &self.answer {
            Ok(servers) => Ok(servers.clone()),
            Err(e) => Err(SrvError::Lookup {
                name: e.to_string(),
                reason: "mock".to_string(),
            }),
        }
    }
}

/// Factory handing out clones of `connector`
pub fn connector_factory(connector: MockConnector) -> ConnectorFactory {
    Arc::new(move || -> Box<dyn RtspConnector> { Box::new(connector.clone()) })
}
