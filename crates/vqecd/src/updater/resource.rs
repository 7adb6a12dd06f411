//! Per-resource update bookkeeping.

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use vqec_common::{ConfigKind, ResourceVersion, ServerAddr};

/// Name of the index resource on the VCDS
pub const INDEX_RESOURCE: &str = "vqec-index";

/// Name of the network (attribute) configuration resource
pub const ATTRIBUTE_RESOURCE: &str = "vqec-network-cfg";

/// Name of the channel lineup resource
pub const CHANNEL_RESOURCE: &str = "vqe-channels";

/// Leading index line carrying the server software version
pub const INDEX_VERSION_TAG: &str = "vcds";

/// Outcome of a resource operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultCode {
    Ok,
    MemError,
    #[default]
    NotAttempted,
    /// Local and remote checksums already match
    Unnecessary,
    /// No servers could be discovered
    ListError,
    CommError,
    /// Server predates indexed updates
    OldVersion,
    UnexpectedReply,
    CommitError,
}

impl ResultCode {
    /// Whether the code counts as a failed update attempt
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::MemError
                | Self::ListError
                | Self::CommError
                | Self::OldVersion
                | Self::UnexpectedReply
                | Self::CommitError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::MemError => "memory allocation error",
            Self::NotAttempted => "not attempted",
            Self::Unnecessary => "unnecessary",
            Self::ListError => "no servers found",
            Self::CommError => "communication error",
            Self::OldVersion => "server does not support indexed updates",
            Self::UnexpectedReply => "unexpected reply",
            Self::CommitError => "commit error",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources the updater fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Index,
    Attribute,
    Channel,
}

impl ResourceKind {
    pub fn resource_name(self) -> &'static str {
        match self {
            Self::Index => INDEX_RESOURCE,
            Self::Attribute => ATTRIBUTE_RESOURCE,
            Self::Channel => CHANNEL_RESOURCE,
        }
    }

    pub fn accept_type(self) -> &'static str {
        match self {
            Self::Index | Self::Attribute => "text/plain",
            Self::Channel => "application/sdp",
        }
    }

    /// Entry in the persisted checksum index, if any
    pub fn config_kind(self) -> Option<ConfigKind> {
        match self {
            Self::Index => None,
            Self::Attribute => Some(ConfigKind::Network),
            Self::Channel => Some(ConfigKind::Channel),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_name())
    }
}

/// State of one cached resource
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceInfo {
    /// Local cache file; `None` means do not persist
    pub datafile: Option<PathBuf>,
    pub last_commit_time: Option<DateTime<Utc>>,
    /// Round trip of the last successful fetch
    pub last_response_time: Option<Duration>,
    pub last_update_result: ResultCode,
    pub total_update_attempts: u64,
    pub total_update_failures: u64,
    pub local_version: ResourceVersion,
    pub remote_version: ResourceVersion,
}

impl ResourceInfo {
    pub fn new(datafile: Option<PathBuf>, local_version: ResourceVersion) -> Self {
        Self {
            datafile,
            local_version,
            ..Self::default()
        }
    }

    /// Count an attempt and store its result
    pub fn record_attempt(&mut self, result: ResultCode) {
        self.total_update_attempts += 1;
        if result.is_failure() {
            self.total_update_failures += 1;
        }
        self.last_update_result = result;
    }
}

/// Details of the most recent index fetch
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexRequestInfo {
    pub servers_found: usize,
    pub servers_attempted: usize,
    /// Server that answered; reused for the named resources
    pub server: Option<ServerAddr>,
    pub result: ResultCode,
    pub vcds_version: Option<String>,
    pub response_time: Option<Duration>,
}

impl IndexRequestInfo {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
