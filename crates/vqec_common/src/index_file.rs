//! Persisted checksum index.
//!
//! Records the last-known checksum of every cached configuration resource so
//! that startup can detect a cache file that was modified or truncated behind
//! the client's back. Stored as a small JSON document next to the caches.

use crate::checksum::ResourceVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Configuration resources tracked by the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    /// Network (attribute) configuration delivered by the server
    Network,
    /// Local override configuration
    Override,
    /// Channel lineup
    Channel,
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Override => "override",
            Self::Channel => "channel",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum IndexFileError {
    #[error("index file IO error: {0}")]
    Io(#[from] io::Error),

    #[error("index file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// On-disk checksum index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChecksumIndex {
    #[serde(default)]
    pub network: ResourceVersion,
    #[serde(default, rename = "override")]
    pub override_cfg: ResourceVersion,
    #[serde(default)]
    pub channel: ResourceVersion,
}

impl ChecksumIndex {
    /// Load the index; a missing file yields all entries "not available".
    pub fn load(path: &Path) -> Result<Self, IndexFileError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the index, treating any failure as an empty index.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!("Ignoring unreadable checksum index {}: {}", path.display(), e);
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), IndexFileError> {
        let json = serde_json::to_string_pretty(self)?;
        write_file_atomic(path, json.as_bytes())?;
        Ok(())
    }

    pub fn get(&self, kind: ConfigKind) -> &ResourceVersion {
        match kind {
            ConfigKind::Network => &self.network,
            ConfigKind::Override => &self.override_cfg,
            ConfigKind::Channel => &self.channel,
        }
    }

    pub fn set(&mut self, kind: ConfigKind, version: ResourceVersion) {
        match kind {
            ConfigKind::Network => self.network = version,
            ConfigKind::Override => self.override_cfg = version,
            ConfigKind::Channel => self.channel = version,
        }
    }
}

/// Update a single entry of the index, preserving the others.
///
/// A malformed existing index is replaced rather than failing the write.
pub fn write_index_checksum(
    path: &Path,
    kind: ConfigKind,
    version: &ResourceVersion,
) -> Result<(), IndexFileError> {
    let mut index = ChecksumIndex::load_or_default(path);
    index.set(kind, version.clone());
    index.save(path)
}

/// Write a file through a sibling temp file and rename it into place.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(tmp_path);
    }
    result
}
