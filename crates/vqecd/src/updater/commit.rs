//! Commit of fetched resources.
//!
//! A commit persists the content to its cache file, records the checksum in
//! the persisted index and then installs the content into the live system
//! under the process-wide lock. The resource-specific parts sit behind
//! [`ResourceCommit`]; the sequencing lives in [`Committer`].

use super::expedite::ExpeditedSection;
use super::resource::{ResourceInfo, ResourceKind};
use super::state::{ServiceState, UpdaterShared};
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};
use vqec_common::index_file::write_file_atomic;
use vqec_common::{
    write_index_checksum, ChannelDb, ChannelError, ConfigError, ConfigLoader, IndexFileError,
    LiveSystem, ResourceVersion, SharedSystem, StagedLineup,
};

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("updater is shutting down")]
    ShuttingDown,

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },

    #[error("failed to record checksum: {0}")]
    Index(#[from] IndexFileError),

    #[error("configuration reload failed: {0}")]
    Config(#[from] ConfigError),

    #[error("channel lineup rejected: {0}")]
    Channel(#[from] ChannelError),

    #[error("malformed index: {0}")]
    MalformedIndex(String),

    #[error("{0} cannot be committed")]
    Unsupported(ResourceKind),
}

/// Content to install
#[derive(Debug, Clone, Copy)]
pub enum CommitPayload<'a> {
    Content(&'a [u8]),
    /// The server no longer offers the resource
    Erase,
}

/// Resource-specific steps of a commit
pub trait ResourceCommit {
    /// Validated form of the payload
    type Staged;

    fn resource(&self) -> ResourceKind;

    /// Validate the payload before anything is written
    fn stage(&self, payload: CommitPayload<'_>) -> Result<Self::Staged, CommitError>;

    /// Whether a persistence failure aborts the commit
    fn persistence_is_fatal(&self) -> bool;

    /// Run the live install at elevated scheduling priority
    fn expedite(&self) -> bool {
        false
    }

    /// Install into the live system; called with the write lock held
    fn apply(&self, live: &mut LiveSystem, staged: Self::Staged) -> Result<(), CommitError>;
}

/// Network configuration attributes
pub struct AttributeCommit {
    loader: Arc<ConfigLoader>,
}

impl AttributeCommit {
    pub fn new(loader: Arc<ConfigLoader>) -> Self {
        Self { loader }
    }
}

impl ResourceCommit for AttributeCommit {
    type Staged = ();

    fn resource(&self) -> ResourceKind {
        ResourceKind::Attribute
    }

    fn stage(&self, _payload: CommitPayload<'_>) -> Result<(), CommitError> {
        // Parsed as part of the merged configuration on apply
        Ok(())
    }

    fn persistence_is_fatal(&self) -> bool {
        true
    }

    fn apply(&self, live: &mut LiveSystem, _staged: ()) -> Result<(), CommitError> {
        let merged = self.loader.read_merged_config()?;
        live.set_live_config(merged, true);
        Ok(())
    }
}

/// Channel lineup
pub struct ChannelCommit {
    system: SharedSystem,
}

impl ChannelCommit {
    pub fn new(system: SharedSystem) -> Self {
        Self { system }
    }
}

impl ResourceCommit for ChannelCommit {
    type Staged = StagedLineup;

    fn resource(&self) -> ResourceKind {
        ResourceKind::Channel
    }

    fn stage(&self, payload: CommitPayload<'_>) -> Result<StagedLineup, CommitError> {
        match payload {
            CommitPayload::Content(buf) => {
                let max_channels = self
                    .system
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .channels()
                    .max_channels();
                Ok(ChannelDb::validate_and_stage(buf, max_channels)?)
            }
            CommitPayload::Erase => Ok(StagedLineup::empty()),
        }
    }

    fn persistence_is_fatal(&self) -> bool {
        false
    }

    fn expedite(&self) -> bool {
        true
    }

    fn apply(&self, live: &mut LiveSystem, staged: StagedLineup) -> Result<(), CommitError> {
        let stats = live.channels_mut().commit_staged(staged)?;
        info!(
            "Channel lineup installed: {} parsed, {} validated, {} total",
            stats.parsed, stats.validated, stats.total
        );
        Ok(())
    }
}

/// Runs commits against the live system
pub struct Committer {
    system: SharedSystem,
    index_path: Option<PathBuf>,
    shared: Arc<UpdaterShared>,
    attribute: AttributeCommit,
    channel: ChannelCommit,
}

impl Committer {
    pub(crate) fn new(
        system: SharedSystem,
        loader: Arc<ConfigLoader>,
        index_path: Option<PathBuf>,
        shared: Arc<UpdaterShared>,
    ) -> Self {
        Self {
            channel: ChannelCommit::new(Arc::clone(&system)),
            system,
            index_path,
            shared,
            attribute: AttributeCommit::new(loader),
        }
    }

    /// Commit `payload` as the new content of `kind`
    pub fn commit(
        &self,
        kind: ResourceKind,
        info: &mut ResourceInfo,
        payload: CommitPayload<'_>,
    ) -> Result<(), CommitError> {
        match kind {
            ResourceKind::Attribute => self.commit_with(&self.attribute, info, payload),
            ResourceKind::Channel => self.commit_with(&self.channel, info, payload),
            ResourceKind::Index => Err(CommitError::Unsupported(kind)),
        }
    }

    fn commit_with<R: ResourceCommit>(
        &self,
        handler: &R,
        info: &mut ResourceInfo,
        payload: CommitPayload<'_>,
    ) -> Result<(), CommitError> {
        let kind = handler.resource();
        let staged = handler.stage(payload)?;
        let version = match payload {
            CommitPayload::Content(buf) => ResourceVersion::of_bytes(buf),
            CommitPayload::Erase => ResourceVersion::NotAvailable,
        };

        if let Err(e) = self.persist(kind, info.datafile.as_deref(), payload, &version) {
            if handler.persistence_is_fatal() {
                return Err(e);
            }
            warn!("Cache update for {} failed, continuing: {}", kind, e);
        }

        let state = self.shared.state();
        if state == ServiceState::Dying {
            return Err(CommitError::ShuttingDown);
        }
        debug!("Installing {} while {}", kind, state);

        let _expedited = handler.expedite().then(ExpeditedSection::enter);
        {
            let mut live = self.system.write().unwrap_or_else(PoisonError::into_inner);
            handler.apply(&mut live, staged)?;
        }

        info.last_commit_time = Some(Utc::now());
        info.local_version = version;
        info!("Committed {} (checksum {})", kind, info.local_version);
        Ok(())
    }

    /// Update the cache file and the checksum index.
    ///
    /// A data file written without its index entry is removed again so the
    /// two never disagree.
    fn persist(
        &self,
        kind: ResourceKind,
        datafile: Option<&Path>,
        payload: CommitPayload<'_>,
        version: &ResourceVersion,
    ) -> Result<(), CommitError> {
        let mut written = None;
        if let Some(path) = datafile {
            match payload {
                CommitPayload::Content(buf) => {
                    write_file_atomic(path, buf).map_err(|source| CommitError::Write {
                        path: path.to_path_buf(),
                        source,
                    })?;
                    written = Some(path);
                }
                CommitPayload::Erase => remove_if_present(path)?,
            }
        }

        let (Some(index_path), Some(config_kind)) = (&self.index_path, kind.config_kind()) else {
            return Ok(());
        };
        if let Err(e) = write_index_checksum(index_path, config_kind, version) {
            if let Some(path) = written {
                if let Err(rm) = fs::remove_file(path) {
                    warn!("Rollback of {} failed: {}", path.display(), rm);
                }
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<(), CommitError> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CommitError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}
