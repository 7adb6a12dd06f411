//! Updater context: everything one init/deinit cycle owns.

use super::commit::Committer;
use super::fetcher::Fetcher;
use super::resource::{IndexRequestInfo, ResourceInfo};
use super::service::NextIndexRequest;
use super::state::{ServiceCommand, UpdaterShared, UpdaterStatus};
use super::UpdaterDeps;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vqec_common::{ChecksumIndex, ConfigKind, ResourceVersion, ServerAddr, SysConfig};

/// Identity used when none is configured and the hostname is unknown
const FALLBACK_IDENTITY: &str = "vqec-client";

/// State of the updater between `init` and `deinit`
pub struct UpdaterContext {
    pub(crate) fetcher: Fetcher,
    pub(crate) committer: Committer,
    pub(crate) shared: Arc<UpdaterShared>,
    pub(crate) commands: Receiver<ServiceCommand>,

    pub(crate) attrcfg: ResourceInfo,
    pub(crate) chancfg: ResourceInfo,
    pub(crate) last_index_request: IndexRequestInfo,
    pub(crate) total_index_attempts: u64,
    pub(crate) total_index_failures: u64,
    pub(crate) last_update_time: Option<DateTime<Utc>>,

    pub(crate) next_index_request: NextIndexRequest,
    pub(crate) update_window: u64,
    pub(crate) poll_interval: u64,
    pub(crate) update_request_issued: bool,
    pub(crate) in_progress: bool,
}

impl UpdaterContext {
    pub(crate) fn new(
        syscfg: &SysConfig,
        deps: &UpdaterDeps,
        shared: Arc<UpdaterShared>,
        commands: Receiver<ServiceCommand>,
    ) -> Self {
        let manual_server = syscfg
            .vcds_server_ip
            .as_deref()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(|ip| ServerAddr::new(ip, syscfg.vcds_server_port));
        if let Some(server) = &manual_server {
            info!("Using configured VCDS {}, discovery disabled", server);
        }

        let fetcher = Fetcher::new(
            (deps.connector)(),
            Arc::clone(&deps.resolver),
            manual_server,
            syscfg.domain_name.clone(),
            client_identity(syscfg),
        );
        let committer = Committer::new(
            Arc::clone(&deps.system),
            Arc::clone(&deps.loader),
            syscfg.index_cfg_path(),
            Arc::clone(&shared),
        );

        let attr_path = syscfg.network_cfg_path();
        let chan_path = syscfg.channel_lineup_path();
        let index = syscfg
            .index_cfg_path()
            .map(|p| ChecksumIndex::load_or_default(&p))
            .unwrap_or_default();
        let attr_version = local_version(attr_path.as_deref(), &index.network);
        let chan_version = local_version(chan_path.as_deref(), &index.channel);

        Self {
            fetcher,
            committer,
            shared,
            commands,
            attrcfg: ResourceInfo::new(attr_path, attr_version),
            chancfg: ResourceInfo::new(chan_path, chan_version),
            last_index_request: IndexRequestInfo::default(),
            total_index_attempts: 0,
            total_index_failures: 0,
            last_update_time: None,
            next_index_request: NextIndexRequest::default(),
            update_window: syscfg.update_window_secs.max(1),
            poll_interval: syscfg.update_interval_secs,
            update_request_issued: false,
            in_progress: false,
        }
    }

    pub fn attr(&self) -> &ResourceInfo {
        &self.attrcfg
    }

    pub fn chan(&self) -> &ResourceInfo {
        &self.chancfg
    }

    pub fn last_index_request(&self) -> &IndexRequestInfo {
        &self.last_index_request
    }

    pub fn identity(&self) -> &str {
        self.fetcher.identity()
    }

    /// Seconds until the next scheduled update, `None` if nothing is scheduled
    pub fn seconds_until_update(&self) -> Option<u64> {
        self.next_index_request.seconds_until_update
    }

    pub fn polling_enabled(&self) -> bool {
        self.poll_interval > 0
    }

    /// Take corruption reports raised since the last look
    pub(crate) fn absorb_corruption(&mut self) {
        for kind in self.shared.take_corrupted() {
            let info = match kind {
                ConfigKind::Network => &mut self.attrcfg,
                ConfigKind::Channel => &mut self.chancfg,
                ConfigKind::Override => continue,
            };
            warn!("Cached {} configuration corrupted, will refetch", kind);
            info.local_version = ResourceVersion::Corrupted;
        }
    }

    /// Build the status snapshot readers see
    pub(crate) fn snapshot(&self) -> UpdaterStatus {
        UpdaterStatus {
            state: self.shared.state(),
            in_progress: self.in_progress,
            seconds_until_next_update: self.next_index_request.seconds_until_update,
            last_update_time: self.last_update_time,
            attr: (&self.attrcfg).into(),
            chan: (&self.chancfg).into(),
            last_index_request: self.last_index_request.clone(),
            total_index_attempts: self.total_index_attempts,
            total_index_failures: self.total_index_failures,
        }
    }

    pub(crate) fn publish(&self) {
        self.shared.publish(self.snapshot());
    }
}

/// Configured identity, else the hostname
fn client_identity(syscfg: &SysConfig) -> String {
    let configured = syscfg.client_identity.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| FALLBACK_IDENTITY.to_string())
}

/// Checksum of the active cache file.
///
/// A file that disagrees with the checksum recorded at commit time is
/// reported as corrupted.
fn local_version(path: Option<&Path>, recorded: &ResourceVersion) -> ResourceVersion {
    let Some(path) = path else {
        return ResourceVersion::NotAvailable;
    };
    match ResourceVersion::of_file(path) {
        Ok(ResourceVersion::Checksum(sum))
            if recorded.is_available() && recorded.as_str() != sum =>
        {
            warn!(
                "{} does not match its recorded checksum {}, treating as corrupted",
                path.display(),
                recorded
            );
            ResourceVersion::Corrupted
        }
        Ok(version) => {
            debug!("Local {} is {}", path.display(), version);
            version
        }
        Err(e) => {
            warn!("Failed to checksum {}: {}", path.display(), e);
            ResourceVersion::NotAvailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_identity_wins() {
        let cfg = SysConfig {
            client_identity: " stb-42 ".to_string(),
            ..SysConfig::default()
        };
        assert_eq!(client_identity(&cfg), "stb-42");
    }

    #[test]
    fn test_identity_never_empty() {
        assert!(!client_identity(&SysConfig::default()).is_empty());
    }

    #[test]
    fn test_local_version_of_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let unrecorded = ResourceVersion::NotAvailable;
        assert_eq!(
            local_version(Some(&dir.path().join("absent")), &unrecorded),
            ResourceVersion::NotAvailable
        );
        assert_eq!(local_version(None, &unrecorded), ResourceVersion::NotAvailable);

        let path = dir.path().join("present");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            local_version(Some(&path), &unrecorded),
            ResourceVersion::of_bytes(b"abc")
        );
    }

    #[test]
    fn test_local_version_checked_against_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("network.toml");
        fs::write(&path, b"fec_enable = true\n").unwrap();

        let recorded = ResourceVersion::of_bytes(b"fec_enable = true\n");
        assert_eq!(local_version(Some(&path), &recorded), recorded);

        let stale = ResourceVersion::of_bytes(b"fec_enable = false\n");
        assert_eq!(
            local_version(Some(&path), &stale),
            ResourceVersion::Corrupted
        );
    }
}
