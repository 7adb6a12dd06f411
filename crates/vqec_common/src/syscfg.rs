//! System configuration for the VQE client.
//!
//! The effective configuration is layered:
//! built-in defaults -> startup file -> network file -> override file.
//! The network file is delivered by the VCDS, the override file is written
//! locally. Both may only set the attribute keys in [`ATTRIBUTE_KEYS`].

use crate::checksum::ResourceVersion;
use crate::index_file::{ChecksumIndex, ConfigKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default startup configuration path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vqec/vqec.toml";

/// Keys the network and override files are allowed to set
pub const ATTRIBUTE_KEYS: &[&str] = &[
    "jitter_buffer_ms",
    "rcc_enable",
    "error_repair_enable",
    "fec_enable",
    "log_level",
];

/// Upper bound on the channel database capacity
pub const MAX_CHANNELS_LIMIT: usize = 10_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysConfig {
    /// Domain for SRV discovery of VCDS servers
    #[serde(default)]
    pub domain_name: String,

    /// Client identity appended to resource requests
    #[serde(default)]
    pub client_identity: String,

    /// Manually configured VCDS server, overrides discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcds_server_ip: Option<String>,

    #[serde(default = "default_vcds_port")]
    pub vcds_server_port: u16,

    /// Random jitter window for update requests, seconds
    #[serde(default = "default_update_window")]
    pub update_window_secs: u64,

    /// Polling interval, seconds (0 disables periodic polling)
    #[serde(default)]
    pub update_interval_secs: u64,

    /// Local cache of the network configuration
    #[serde(default)]
    pub network_cfg_pathname: String,

    /// Locally written override configuration
    #[serde(default)]
    pub override_cfg_pathname: String,

    /// Local cache of the channel lineup
    #[serde(default)]
    pub channel_lineup_pathname: String,

    /// Persisted checksum index
    #[serde(default)]
    pub index_cfg_pathname: String,

    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    // Attributes: may be changed at runtime by the network/override files.
    #[serde(default = "default_jitter_buffer_ms")]
    pub jitter_buffer_ms: u32,

    #[serde(default = "default_true")]
    pub rcc_enable: bool,

    #[serde(default = "default_true")]
    pub error_repair_enable: bool,

    #[serde(default = "default_true")]
    pub fec_enable: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_vcds_port() -> u16 {
    554
}

fn default_update_window() -> u64 {
    30
}

fn default_max_channels() -> usize {
    crate::channel_db::DEFAULT_MAX_CHANNELS
}

fn default_jitter_buffer_ms() -> u32 {
    200
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SysConfig {
    fn default() -> Self {
        Self {
            domain_name: String::new(),
            client_identity: String::new(),
            vcds_server_ip: None,
            vcds_server_port: default_vcds_port(),
            update_window_secs: default_update_window(),
            update_interval_secs: 0,
            network_cfg_pathname: String::new(),
            override_cfg_pathname: String::new(),
            channel_lineup_pathname: String::new(),
            index_cfg_pathname: String::new(),
            max_channels: default_max_channels(),
            jitter_buffer_ms: default_jitter_buffer_ms(),
            rcc_enable: true,
            error_repair_enable: true,
            fec_enable: true,
            log_level: default_log_level(),
        }
    }
}

impl SysConfig {
    /// Parse a configuration document, missing keys take defaults
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Clamp values into their supported ranges
    pub fn sanitize(mut self) -> Self {
        if self.update_window_secs == 0 {
            warn!("update_window_secs must be at least 1, using 1");
            self.update_window_secs = 1;
        }
        if self.update_interval_secs != 0 && self.update_interval_secs < self.update_window_secs {
            warn!(
                "update_interval_secs {} is shorter than the update window, using {}",
                self.update_interval_secs, self.update_window_secs
            );
            self.update_interval_secs = self.update_window_secs;
        }
        if self.max_channels == 0 || self.max_channels > MAX_CHANNELS_LIMIT {
            let clamped = self.max_channels.clamp(1, MAX_CHANNELS_LIMIT);
            warn!("max_channels {} out of range, using {}", self.max_channels, clamped);
            self.max_channels = clamped;
        }
        self
    }

    /// Copy only the runtime-updatable attributes from another config
    pub fn apply_attributes(&mut self, other: &SysConfig) {
        self.jitter_buffer_ms = other.jitter_buffer_ms;
        self.rcc_enable = other.rcc_enable;
        self.error_repair_enable = other.error_repair_enable;
        self.fec_enable = other.fec_enable;
        self.log_level = other.log_level.clone();
    }

    pub fn network_cfg_path(&self) -> Option<PathBuf> {
        non_empty_path(&self.network_cfg_pathname)
    }

    pub fn override_cfg_path(&self) -> Option<PathBuf> {
        non_empty_path(&self.override_cfg_pathname)
    }

    pub fn channel_lineup_path(&self) -> Option<PathBuf> {
        non_empty_path(&self.channel_lineup_pathname)
    }

    pub fn index_cfg_path(&self) -> Option<PathBuf> {
        non_empty_path(&self.index_cfg_pathname)
    }

    /// Cache file path of a resource kind
    pub fn path_for(&self, kind: ConfigKind) -> Option<PathBuf> {
        match kind {
            ConfigKind::Network => self.network_cfg_path(),
            ConfigKind::Override => self.override_cfg_path(),
            ConfigKind::Channel => self.channel_lineup_path(),
        }
    }
}

fn non_empty_path(path: &str) -> Option<PathBuf> {
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

/// Called when a cached resource fails its integrity check
pub type CorruptionCallback = Arc<dyn Fn(ConfigKind) + Send + Sync>;

/// Reads and merges the configuration layers
pub struct ConfigLoader {
    startup_path: Option<PathBuf>,
    callbacks: Mutex<HashMap<ConfigKind, CorruptionCallback>>,
}

impl ConfigLoader {
    pub fn new(startup_path: Option<PathBuf>) -> Self {
        Self {
            startup_path,
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn startup_path(&self) -> Option<&Path> {
        self.startup_path.as_deref()
    }

    /// Register the handler for corruption of one resource kind
    pub fn register_corruption_callback(&self, kind: ConfigKind, callback: CorruptionCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, callback);
    }

    pub fn unregister_corruption_callback(&self, kind: ConfigKind) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);
    }

    /// Notify the registered handler that a cached resource is corrupted
    pub fn report_corruption(&self, kind: ConfigKind) {
        let callback = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        warn!("Cached {} configuration failed its integrity check", kind);
        // Invoked outside the registry lock: the handler may re-register.
        if let Some(callback) = callback {
            callback(kind);
        }
    }

    /// Build the effective configuration from all layers
    pub fn read_merged_config(&self) -> Result<SysConfig, ConfigError> {
        let mut merged = toml::Table::new();

        if let Some(path) = &self.startup_path {
            let table = read_table(path)?;
            merge_tables(&mut merged, table);
        }

        let base: SysConfig = toml::Value::Table(merged.clone())
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(e.to_string()))?;
        let index = base
            .index_cfg_path()
            .map(|p| ChecksumIndex::load_or_default(&p))
            .unwrap_or_default();

        for kind in [ConfigKind::Network, ConfigKind::Override] {
            if let Some(path) = base.path_for(kind) {
                if let Some(table) = self.read_attribute_layer(&path, kind, index.get(kind)) {
                    merge_tables(&mut merged, table);
                }
            }
        }

        let config: SysConfig = toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(e.to_string()))?;
        Ok(config.sanitize())
    }

    /// Read a network/override layer; a missing, corrupted or unparsable
    /// layer is skipped.
    fn read_attribute_layer(
        &self,
        path: &Path,
        kind: ConfigKind,
        recorded: &ResourceVersion,
    ) -> Option<toml::Table> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No {} configuration at {}", kind, path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return None;
            }
        };

        if recorded.is_available() && ResourceVersion::of_bytes(&content) != *recorded {
            self.report_corruption(kind);
            return None;
        }

        let text = match String::from_utf8(content) {
            Ok(text) => text,
            Err(_) => {
                warn!("{} is not valid UTF-8, ignored", path.display());
                return None;
            }
        };
        let table: toml::Table = match toml::from_str(&text) {
            Ok(table) => table,
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                return None;
            }
        };

        let mut attributes = toml::Table::new();
        for (key, value) in table {
            if ATTRIBUTE_KEYS.contains(&key.as_str()) {
                attributes.insert(key, value);
            } else {
                warn!("{} may not set '{}', ignored", path.display(), key);
            }
        }
        info!("Applied {} configuration from {}", kind, path.display());
        Some(attributes)
    }

    /// Read the cached channel lineup, verifying it against the index.
    ///
    /// Returns `None` when the lineup is absent or corrupted.
    pub fn read_cached_lineup(&self, config: &SysConfig) -> Option<Vec<u8>> {
        let path = config.channel_lineup_path()?;
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {}", path.display(), e);
                }
                return None;
            }
        };

        if let Some(index_path) = config.index_cfg_path() {
            let recorded = ChecksumIndex::load_or_default(&index_path).channel;
            if recorded.is_available() && ResourceVersion::of_bytes(&content) != recorded {
                self.report_corruption(ConfigKind::Channel);
                return None;
            }
        }
        Some(content)
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Recursive table merge, `overlay` wins
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
