//! Resource fetcher.
//!
//! Builds the candidate server list for a resource and tries each candidate
//! with an RTSP DESCRIBE until one answers or the list is exhausted.
//! Candidate order for the index comes from DNS SRV, randomly permuted so the
//! client population spreads across the VCDS replicas.

use super::commit::CommitError;
use super::resource::{IndexRequestInfo, ResourceKind, ResultCode};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use vqec_common::srv::{VCDS_PROTOCOL, VCDS_SERVICE};
use vqec_common::{RtspConnector, ServerAddr, SrvResolver};

/// Result of a single fetch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchOutcome {
    pub result: ResultCode,
    /// Round trip of the successful DESCRIBE
    pub response_time: Option<Duration>,
}

impl FetchOutcome {
    fn failed(result: ResultCode) -> Self {
        Self {
            result,
            response_time: None,
        }
    }
}

/// Fetches resources from the VCDS fleet
pub struct Fetcher {
    connector: Box<dyn RtspConnector>,
    resolver: Arc<dyn SrvResolver>,
    manual_server: Option<ServerAddr>,
    domain_name: String,
    identity: String,
}

impl Fetcher {
    pub fn new(
        connector: Box<dyn RtspConnector>,
        resolver: Arc<dyn SrvResolver>,
        manual_server: Option<ServerAddr>,
        domain_name: String,
        identity: String,
    ) -> Self {
        Self {
            connector,
            resolver,
            manual_server,
            domain_name,
            identity,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Request path for a resource, with the client identity when allowed
    pub fn resource_path(&self, resource: ResourceKind, use_identity: bool) -> String {
        if use_identity && !self.identity.is_empty() {
            format!("{}/{}", resource.resource_name(), self.identity)
        } else {
            resource.resource_name().to_string()
        }
    }

    /// Fetch `resource` and hand a 200 body to `commit`.
    ///
    /// Named resources are fetched from the server that last answered the
    /// index request; index fetches record their server details in
    /// `index_request`.
    pub fn fetch_resource(
        &mut self,
        resource: ResourceKind,
        use_identity: bool,
        deadline: Instant,
        index_request: &mut IndexRequestInfo,
        commit: &mut dyn FnMut(&[u8]) -> Result<(), CommitError>,
    ) -> FetchOutcome {
        let servers = match self.candidate_servers(resource, index_request) {
            Ok(servers) => servers,
            Err(code) => return FetchOutcome::failed(code),
        };
        if resource == ResourceKind::Index {
            index_request.servers_found = servers.len();
        }

        let path = self.resource_path(resource, use_identity);
        for server in &servers {
            if Instant::now() >= deadline {
                warn!("Deadline expired before {} could be fetched", resource);
                break;
            }
            if resource == ResourceKind::Index {
                index_request.servers_attempted += 1;
            }

            let started = Instant::now();
            if let Err(e) = self.connector.connect(server, deadline) {
                debug!("Connect to {} failed: {}", server, e);
                continue;
            }
            let reply = self
                .connector
                .describe(&path, resource.accept_type(), deadline);
            self.connector.close();

            let response = match reply {
                Ok(response) => response,
                Err(e) => {
                    debug!("DESCRIBE {} on {} failed: {}", path, server, e);
                    continue;
                }
            };

            match response.code {
                404 | 415 if resource == ResourceKind::Index && response.server().is_none() => {
                    info!(
                        "Server {} does not support indexed updates (reply {})",
                        server, response.code
                    );
                    index_request.server = Some(server.clone());
                    return FetchOutcome::failed(ResultCode::OldVersion);
                }
                200 => {
                    let elapsed = started.elapsed();
                    if resource == ResourceKind::Index {
                        index_request.server = Some(server.clone());
                        index_request.response_time = Some(elapsed);
                    }
                    let result = match commit(&response.body) {
                        Ok(()) => ResultCode::Ok,
                        Err(e) => {
                            warn!("Commit of {} from {} failed: {}", resource, server, e);
                            ResultCode::CommitError
                        }
                    };
                    return FetchOutcome {
                        result,
                        response_time: Some(elapsed),
                    };
                }
                code => {
                    warn!(
                        "Unexpected reply {} {} for {} from {}",
                        code, response.reason, path, server
                    );
                    return FetchOutcome::failed(ResultCode::UnexpectedReply);
                }
            }
        }

        warn!("No server delivered {}", resource);
        FetchOutcome::failed(ResultCode::CommError)
    }

    fn candidate_servers(
        &self,
        resource: ResourceKind,
        index_request: &IndexRequestInfo,
    ) -> Result<Vec<ServerAddr>, ResultCode> {
        if let Some(server) = &self.manual_server {
            return Ok(vec![server.clone()]);
        }

        if resource != ResourceKind::Index {
            return index_request.server.clone().map(|s| vec![s]).ok_or_else(|| {
                warn!("No index server known for {}", resource);
                ResultCode::ListError
            });
        }

        let records = self
            .resolver
            .lookup_srv(&self.domain_name, VCDS_SERVICE, VCDS_PROTOCOL)
            .map_err(|e| {
                warn!("Server discovery failed: {}", e);
                ResultCode::ListError
            })?;
        if records.is_empty() {
            return Err(ResultCode::ListError);
        }

        let mut servers = Vec::new();
        servers
            .try_reserve_exact(records.len())
            .map_err(|_| ResultCode::MemError)?;
        servers.extend(records);
        if servers.len() > 1 {
            shuffle_servers(&mut servers, clock_seed());
        }
        Ok(servers)
    }
}

/// Uniformly permute the candidate list
pub fn shuffle_servers(servers: &mut [ServerAddr], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    servers.shuffle(&mut rng);
}

/// Seed from the wall clock in microseconds
pub(crate) fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
