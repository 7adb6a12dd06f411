//! Lifecycle state shared between the API handle and the service thread.

use super::resource::{IndexRequestInfo, ResourceInfo, ResultCode};
use chrono::{DateTime, Utc};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use vqec_common::{ConfigKind, ResourceVersion};

/// Updater lifecycle: Uninitialized -> Initialized -> Running -> Dying -> Uninitialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    #[default]
    Uninitialized,
    Initialized,
    Running,
    Dying,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Dying => "dying",
        };
        f.write_str(name)
    }
}

/// Messages to the service thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceCommand {
    /// Schedule an update within the jitter window
    Update,
    /// Wake up and notice the Dying state
    Shutdown,
}

/// Status of one resource
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceStatus {
    pub last_commit_time: Option<DateTime<Utc>>,
    pub version: ResourceVersion,
    pub remote_version: ResourceVersion,
    pub last_update_result: ResultCode,
    pub last_response_time: Option<Duration>,
    pub total_update_attempts: u64,
    pub total_update_failures: u64,
}

impl From<&ResourceInfo> for ResourceStatus {
    fn from(info: &ResourceInfo) -> Self {
        Self {
            last_commit_time: info.last_commit_time,
            version: info.local_version.clone(),
            remote_version: info.remote_version.clone(),
            last_update_result: info.last_update_result,
            last_response_time: info.last_response_time,
            total_update_attempts: info.total_update_attempts,
            total_update_failures: info.total_update_failures,
        }
    }
}

/// Point-in-time view of the updater
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdaterStatus {
    pub state: ServiceState,
    pub in_progress: bool,
    /// `None` when no update is scheduled
    pub seconds_until_next_update: Option<u64>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub attr: ResourceStatus,
    pub chan: ResourceStatus,
    pub last_index_request: IndexRequestInfo,
    pub total_index_attempts: u64,
    pub total_index_failures: u64,
}

/// State reachable from any thread
#[derive(Default)]
pub(crate) struct UpdaterShared {
    state: Mutex<ServiceState>,
    status: Mutex<UpdaterStatus>,
    commands: Mutex<Option<Sender<ServiceCommand>>>,
    polling_enabled: AtomicBool,
    corrupted: Mutex<Vec<ConfigKind>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UpdaterShared {
    pub(crate) fn state(&self) -> ServiceState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, next: ServiceState) {
        let mut state = lock(&self.state);
        if *state != next {
            info!("Updater state {} -> {}", *state, next);
            *state = next;
        }
    }

    /// Prepare for a new init cycle
    pub(crate) fn reset(&self, commands: Sender<ServiceCommand>, polling_enabled: bool) {
        *lock(&self.commands) = Some(commands);
        *lock(&self.status) = UpdaterStatus::default();
        lock(&self.corrupted).clear();
        self.polling_enabled.store(polling_enabled, Ordering::SeqCst);
    }

    pub(crate) fn polling_enabled(&self) -> bool {
        self.polling_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn send(&self, command: ServiceCommand) -> bool {
        match lock(&self.commands).as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    pub(crate) fn close_commands(&self) {
        lock(&self.commands).take();
    }

    /// Ask the service for an update.
    ///
    /// With periodic polling enabled an unforced request is dropped, the next
    /// poll covers it.
    pub(crate) fn trigger_update(&self, force: bool) {
        if self.polling_enabled() && !force {
            debug!("Update request ignored, polling already enabled");
            return;
        }
        if !self.send(ServiceCommand::Update) {
            debug!("Update request ignored, updater not initialized");
        }
    }

    /// Corruption handler registered with the configuration loader
    pub(crate) fn report_corruption(&self, kind: ConfigKind) {
        lock(&self.corrupted).push(kind);
        self.trigger_update(true);
    }

    pub(crate) fn take_corrupted(&self) -> Vec<ConfigKind> {
        mem::take(&mut *lock(&self.corrupted))
    }

    pub(crate) fn publish(&self, status: UpdaterStatus) {
        *lock(&self.status) = status;
    }

    /// Snapshot taken under the status lock
    pub(crate) fn status(&self) -> UpdaterStatus {
        let mut status = lock(&self.status).clone();
        status.state = self.state();
        status
    }
}
