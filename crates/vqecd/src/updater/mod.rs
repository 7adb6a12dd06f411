//! VQE-C Updater - keeps the network configuration and channel lineup in
//! step with the VCDS fleet.
//!
//! Lifecycle:
//! 1. init      - build the context from the system configuration
//! 2. start     - hand the context to the service thread
//! 3. update    - request an update within the jitter window
//! 4. stop      - mark the service dying, the thread exits on its next wake
//! 5. deinit    - drop the context or stop the thread
//!
//! Each update pass fetches the index, compares the advertised checksums
//! with the cached resources and fetches, erases or skips each one. Commits
//! go to the cache file, the checksum index and the live system, in that
//! order.

pub mod commit;
pub mod context;
pub mod expedite;
pub mod fetcher;
pub mod orchestrator;
pub mod resource;
pub mod service;
pub mod state;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use commit::{CommitError, CommitPayload};
pub use context::UpdaterContext;
pub use orchestrator::{parse_index, ParsedIndex, UpdateOutcome};
pub use resource::{IndexRequestInfo, ResourceInfo, ResourceKind, ResultCode};
pub use state::{ResourceStatus, ServiceState, UpdaterStatus};

use state::{ServiceCommand, UpdaterShared};
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};
use vqec_common::{
    ConfigKind, ConfigLoader, CorruptionCallback, RtspClient, RtspConnector, SharedSystem,
    SrvResolver, SysConfig, SystemSrvResolver,
};

/// Fetch budget of the update run during client startup
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts to wait for a dying service thread during init
const THREAD_EXIT_POLLS: u32 = 5;

const THREAD_EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const THREAD_NAME: &str = "vqec-updater";

/// Resources whose cache corruption forces an update
const WATCHED_CONFIGS: [ConfigKind; 2] = [ConfigKind::Network, ConfigKind::Channel];

#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("updater already initialized")]
    AlreadyInitialized,

    #[error("updater not initialized")]
    NotInitialized,

    #[error("updater service is running")]
    ServiceRunning,

    #[error("previous updater thread did not exit")]
    DestroyThreadError,

    #[error("failed to spawn updater thread: {0}")]
    ThreadCreate(#[from] io::Error),
}

/// Builds a fresh RTSP session per init cycle
pub type ConnectorFactory = Arc<dyn Fn() -> Box<dyn RtspConnector> + Send + Sync>;

/// Collaborators of the updater
#[derive(Clone)]
pub struct UpdaterDeps {
    pub system: SharedSystem,
    pub loader: Arc<ConfigLoader>,
    pub resolver: Arc<dyn SrvResolver>,
    pub connector: ConnectorFactory,
}

impl UpdaterDeps {
    /// Production wiring: system DNS and the TCP RTSP client
    pub fn new(system: SharedSystem, loader: Arc<ConfigLoader>) -> Self {
        let user_agent = format!("vqec/{}", env!("CARGO_PKG_VERSION"));
        Self {
            system,
            loader,
            resolver: Arc::new(SystemSrvResolver),
            connector: Arc::new(move || -> Box<dyn RtspConnector> {
                Box::new(RtspClient::new(user_agent.clone()))
            }),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SrvResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_connector(mut self, connector: ConnectorFactory) -> Self {
        self.connector = connector;
        self
    }
}

/// Handle to the updater service
pub struct Updater {
    deps: UpdaterDeps,
    shared: Arc<UpdaterShared>,
    /// Present while initialized and not handed to the thread
    context: Option<UpdaterContext>,
    thread: Option<JoinHandle<()>>,
}

impl Updater {
    pub fn new(deps: UpdaterDeps) -> Self {
        Self {
            deps,
            shared: Arc::new(UpdaterShared::default()),
            context: None,
            thread: None,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.shared.state()
    }

    /// Build a fresh context from `syscfg`
    pub fn init(&mut self, syscfg: &SysConfig) -> Result<(), UpdaterError> {
        match self.shared.state() {
            ServiceState::Initialized | ServiceState::Running => {
                return Err(UpdaterError::AlreadyInitialized)
            }
            ServiceState::Dying => self.wait_for_thread_exit()?,
            ServiceState::Uninitialized => {}
        }

        let (tx, rx) = mpsc::channel();
        self.shared.reset(tx, syscfg.update_interval_secs > 0);
        let ctx = UpdaterContext::new(syscfg, &self.deps, Arc::clone(&self.shared), rx);
        self.register_corruption_handlers();

        self.shared.set_state(ServiceState::Initialized);
        ctx.publish();
        info!(
            "Updater initialized: identity '{}', attributes {}, channels {}",
            ctx.identity(),
            ctx.attr().local_version,
            ctx.chan().local_version
        );
        self.context = Some(ctx);
        Ok(())
    }

    fn wait_for_thread_exit(&self) -> Result<(), UpdaterError> {
        for attempt in 1..=THREAD_EXIT_POLLS {
            if self.shared.state() == ServiceState::Uninitialized {
                return Ok(());
            }
            warn!(
                "Waiting for previous updater thread to exit ({}/{})",
                attempt, THREAD_EXIT_POLLS
            );
            thread::sleep(THREAD_EXIT_POLL_INTERVAL);
        }
        if self.shared.state() == ServiceState::Uninitialized {
            return Ok(());
        }
        error!("Previous updater thread is still alive");
        Err(UpdaterError::DestroyThreadError)
    }

    fn register_corruption_handlers(&self) {
        let shared: Weak<UpdaterShared> = Arc::downgrade(&self.shared);
        let handler: CorruptionCallback = Arc::new(move |kind: ConfigKind| {
            if let Some(shared) = shared.upgrade() {
                shared.report_corruption(kind);
            }
        });
        for kind in WATCHED_CONFIGS {
            self.deps
                .loader
                .register_corruption_callback(kind, Arc::clone(&handler));
        }
    }

    fn unregister_corruption_handlers(&self) {
        for kind in WATCHED_CONFIGS {
            self.deps.loader.unregister_corruption_callback(kind);
        }
    }

    /// Run one update pass on the calling thread with the startup budget
    pub fn startup_update(&mut self) -> Result<UpdateOutcome, UpdaterError> {
        self.request_update(true, true, true, Instant::now() + STARTUP_TIMEOUT)
    }

    /// Run one update pass on the calling thread; only before `start`
    pub fn request_update(
        &mut self,
        refresh_index: bool,
        update_attr: bool,
        update_chan: bool,
        deadline: Instant,
    ) -> Result<UpdateOutcome, UpdaterError> {
        match self.context.as_mut() {
            Some(ctx) => Ok(ctx.request_update(refresh_index, update_attr, update_chan, deadline)),
            None if self.shared.state() == ServiceState::Running => {
                Err(UpdaterError::ServiceRunning)
            }
            None => Err(UpdaterError::NotInitialized),
        }
    }

    /// Context of an initialized, not yet started updater
    pub fn context(&self) -> Option<&UpdaterContext> {
        self.context.as_ref()
    }

    /// Start the service thread
    pub fn start(&mut self) -> Result<(), UpdaterError> {
        match self.shared.state() {
            ServiceState::Initialized => {}
            ServiceState::Running => return Err(UpdaterError::ServiceRunning),
            _ => return Err(UpdaterError::NotInitialized),
        }
        let mut ctx = self.context.take().ok_or(UpdaterError::NotInitialized)?;
        ctx.prepare_start();

        // The thread takes the context out of the slot; if the spawn fails
        // it is still there to put back.
        let slot = Arc::new(Mutex::new(Some(ctx)));
        let thread_slot = Arc::clone(&slot);
        self.shared.set_state(ServiceState::Running);

        let spawned = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let ctx = thread_slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(ctx) = ctx {
                    service::run(ctx);
                }
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn updater thread: {}", e);
                self.context = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                self.shared.set_state(ServiceState::Initialized);
                Err(UpdaterError::ThreadCreate(e))
            }
        }
    }

    /// Request an update. Unforced requests are dropped while periodic
    /// polling is enabled.
    pub fn update(&self, force: bool) {
        self.shared.trigger_update(force);
    }

    /// Ask the service thread to exit; does not wait for it
    pub fn stop(&mut self) {
        if self.shared.state() != ServiceState::Running {
            return;
        }
        // Detached: the thread notices Dying on its next wake
        self.thread.take();
        self.shared.set_state(ServiceState::Dying);
        self.shared.send(ServiceCommand::Shutdown);
        self.shared.close_commands();
        self.unregister_corruption_handlers();
    }

    pub fn deinit(&mut self) {
        match self.shared.state() {
            ServiceState::Initialized => {
                self.context = None;
                self.shared.close_commands();
                self.unregister_corruption_handlers();
                self.shared.set_state(ServiceState::Uninitialized);
            }
            ServiceState::Running => self.stop(),
            ServiceState::Uninitialized | ServiceState::Dying => {}
        }
    }

    /// Snapshot of the updater and resource status
    pub fn status(&self) -> UpdaterStatus {
        self.shared.status()
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        self.deinit();
    }
}
