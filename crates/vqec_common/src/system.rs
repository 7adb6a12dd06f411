//! Live client state shared with the interface API.
//!
//! The active configuration and channel database sit behind one process-wide
//! lock. Writers hold it only for in-memory swaps, never across network I/O.

use crate::channel_db::ChannelDb;
use crate::syscfg::SysConfig;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Active configuration plus channel database
#[derive(Debug)]
pub struct LiveSystem {
    config: SysConfig,
    channels: ChannelDb,
    config_generation: u64,
}

/// Handle to the process-wide lock
pub type SharedSystem = Arc<RwLock<LiveSystem>>;

impl LiveSystem {
    pub fn new(config: SysConfig) -> Self {
        let channels = ChannelDb::new(config.max_channels);
        Self {
            config,
            channels,
            config_generation: 0,
        }
    }

    pub fn into_shared(self) -> SharedSystem {
        Arc::new(RwLock::new(self))
    }

    pub fn config(&self) -> &SysConfig {
        &self.config
    }

    /// Install a new configuration.
    ///
    /// Updates only replace the runtime-updatable attributes; the rest of the
    /// startup configuration stays in effect until restart.
    pub fn set_live_config(&mut self, config: SysConfig, is_update: bool) {
        if is_update {
            self.config.apply_attributes(&config);
        } else {
            self.channels.set_max_channels(config.max_channels);
            self.config = config;
        }
        self.config_generation += 1;
        info!(
            "Live configuration {} (generation {})",
            if is_update { "updated" } else { "replaced" },
            self.config_generation
        );
    }

    /// Number of configuration installs since startup
    pub fn config_generation(&self) -> u64 {
        self.config_generation
    }

    pub fn channels(&self) -> &ChannelDb {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut ChannelDb {
        &mut self.channels
    }
}
