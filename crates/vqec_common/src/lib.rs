//! VQE-C Common - configuration, channel lineup and transport primitives
//!
//! Shared by the update service and the client interface.

pub mod channel_db;
pub mod checksum;
pub mod index_file;
pub mod rtsp;
pub mod srv;
pub mod syscfg;
pub mod system;

pub use channel_db::{Channel, ChannelDb, ChannelError, LineupStats, StagedLineup};
pub use checksum::{checksum_bytes, ResourceVersion, FILE_CORRUPTED, FILE_NOT_AVAILABLE};
pub use index_file::{write_index_checksum, ChecksumIndex, ConfigKind, IndexFileError};
pub use rtsp::{RtspClient, RtspConnector, RtspError, RtspResponse, ServerAddr};
pub use srv::{SrvError, SrvResolver, SystemSrvResolver};
pub use syscfg::{ConfigError, ConfigLoader, CorruptionCallback, SysConfig};
pub use system::{LiveSystem, SharedSystem};
