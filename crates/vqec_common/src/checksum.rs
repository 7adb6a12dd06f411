//! Content checksums for configuration resources.
//!
//! Every resource the client caches (network config, override config, channel
//! lineup) is identified by the MD5 of its bytes, rendered as 32 lowercase hex
//! characters. The same rendering is used on the wire (index file) and in the
//! persisted checksum index.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Length of a rendered checksum
pub const CHECKSUM_LEN: usize = 32;

/// Sentinel for "resource absent"
pub const FILE_NOT_AVAILABLE: &str = "file not available";

/// Sentinel for a local copy that failed its integrity check
pub const FILE_CORRUPTED: &str = "file corrupted";

/// Version of a resource as known locally or advertised remotely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceVersion {
    /// MD5 of the content, 32 lowercase hex characters
    Checksum(String),
    /// No such resource (locally or on the server)
    #[default]
    NotAvailable,
    /// Local copy exists but does not match its recorded checksum
    Corrupted,
}

impl ResourceVersion {
    /// Checksum of an in-memory buffer
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::Checksum(checksum_bytes(data))
    }

    /// Checksum of a file's content.
    ///
    /// A missing file is the same as an absent resource.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        match fs::read(path) {
            Ok(data) => Ok(Self::of_bytes(&data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::NotAvailable),
            Err(e) => Err(e),
        }
    }

    /// Parse a checksum as it appears in an index file.
    ///
    /// Returns `None` when the text is not a well-formed checksum.
    pub fn parse_checksum(text: &str) -> Option<Self> {
        let text = text.trim();
        if is_valid_checksum(text) {
            Some(Self::Checksum(text.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Checksum(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Checksum(sum) => sum,
            Self::NotAvailable => FILE_NOT_AVAILABLE,
            Self::Corrupted => FILE_CORRUPTED,
        }
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ResourceVersion {
    fn from(text: String) -> Self {
        if text == FILE_CORRUPTED {
            return Self::Corrupted;
        }
        Self::parse_checksum(&text).unwrap_or(Self::NotAvailable)
    }
}

impl From<ResourceVersion> for String {
    fn from(version: ResourceVersion) -> Self {
        version.as_str().to_string()
    }
}

/// MD5 of a buffer as 32 lowercase hex characters
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// True for exactly 32 hex digits
pub fn is_valid_checksum(text: &str) -> bool {
    text.len() == CHECKSUM_LEN && text.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digest() {
        assert_eq!(checksum_bytes(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            checksum_bytes(b"The quick brown fox jumps over the lazy dog"),
            "9e107d9d372bb6826bd81d3542a419d6"
        );
    }

    #[test]
    fn test_file_checksum_matches_buffer_checksum() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("network.cfg");
        let content = b"jitter_buffer_ms = 250\nrcc_enable = false\n";
        fs::write(&path, content).unwrap();

        let from_file = ResourceVersion::of_file(&path).unwrap();
        assert_eq!(from_file, ResourceVersion::of_bytes(content));
        assert_eq!(from_file.as_str().len(), CHECKSUM_LEN);
    }

    #[test]
    fn test_missing_file_is_not_available() {
        let temp = TempDir::new().unwrap();
        let version = ResourceVersion::of_file(&temp.path().join("absent")).unwrap();
        assert_eq!(version, ResourceVersion::NotAvailable);
        assert_eq!(version.to_string(), FILE_NOT_AVAILABLE);
    }

    #[test]
    fn test_parse_checksum() {
        assert!(ResourceVersion::parse_checksum("e89ab785efbe3a674655b21e998ab5bd").is_some());
        assert!(ResourceVersion::parse_checksum("E89AB785EFBE3A674655B21E998AB5BD").is_some());
        assert!(ResourceVersion::parse_checksum("<unknown version>").is_none());
        assert!(ResourceVersion::parse_checksum("e89ab785").is_none());
    }

    #[test]
    fn test_string_conversion_keeps_sentinels() {
        assert_eq!(
            ResourceVersion::from(FILE_CORRUPTED.to_string()),
            ResourceVersion::Corrupted
        );
        assert_eq!(
            ResourceVersion::from(FILE_NOT_AVAILABLE.to_string()),
            ResourceVersion::NotAvailable
        );
        let sum = "f02d77ad5d121f00b124d4aa5651e2f8".to_string();
        assert_eq!(
            String::from(ResourceVersion::from(sum.clone())),
            sum
        );
    }
}
