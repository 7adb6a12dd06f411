//! DNS SRV discovery of update servers.

use crate::rtsp::ServerAddr;
use thiserror::Error;
use tracing::debug;

/// Service label of the VCDS update service
pub const VCDS_SERVICE: &str = "_rtsp";

/// Protocol label of the VCDS update service
pub const VCDS_PROTOCOL: &str = "_tcp";

#[derive(Error, Debug, PartialEq)]
pub enum SrvError {
    #[error("no discovery domain configured")]
    NoDomain,

    #[error("resolver unavailable: {0}")]
    Resolver(String),

    #[error("SRV lookup for {name} failed: {reason}")]
    Lookup { name: String, reason: String },

    #[error("no SRV records for {0}")]
    NoRecords(String),
}

/// Resolver for SRV records
pub trait SrvResolver: Send + Sync {
    /// Look up `<service>.<protocol>.<domain>`, one entry per record
    fn lookup_srv(
        &self,
        domain: &str,
        service: &str,
        protocol: &str,
    ) -> Result<Vec<ServerAddr>, SrvError>;
}

/// Build the SRV query name
pub fn srv_name(domain: &str, service: &str, protocol: &str) -> String {
    format!("{}.{}.{}", service, protocol, domain.trim_end_matches('.'))
}

/// Resolver using the host's DNS configuration
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSrvResolver;

impl SrvResolver for SystemSrvResolver {
    fn lookup_srv(
        &self,
        domain: &str,
        service: &str,
        protocol: &str,
    ) -> Result<Vec<ServerAddr>, SrvError> {
        if domain.is_empty() {
            return Err(SrvError::NoDomain);
        }
        let name = srv_name(domain, service, protocol);

        let resolver = hickory_resolver::Resolver::from_system_conf()
            .map_err(|e| SrvError::Resolver(e.to_string()))?;
        let lookup = resolver
            .srv_lookup(name.as_str())
            .map_err(|e| SrvError::Lookup {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        let servers: Vec<ServerAddr> = lookup
            .iter()
            .map(|srv| {
                let target = srv.target().to_utf8();
                ServerAddr::new(target.trim_end_matches('.'), srv.port())
            })
            .collect();
        debug!("SRV {} returned {} servers", name, servers.len());

        if servers.is_empty() {
            return Err(SrvError::NoRecords(name));
        }
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srv_name() {
        assert_eq!(
            srv_name("vqe.example.com", VCDS_SERVICE, VCDS_PROTOCOL),
            "_rtsp._tcp.vqe.example.com"
        );
        assert_eq!(srv_name("example.com.", "_rtsp", "_tcp"), "_rtsp._tcp.example.com");
    }

    #[test]
    fn test_empty_domain_rejected() {
        assert_eq!(
            SystemSrvResolver.lookup_srv("", VCDS_SERVICE, VCDS_PROTOCOL),
            Err(SrvError::NoDomain)
        );
    }
}
