//! Updater service thread.
//!
//! Wakes once per second, counts down to the next scheduled index request
//! and runs the update pass when it falls due. Update requests and shutdown
//! arrive on the command channel and are handled on the next wake.

use super::context::UpdaterContext;
use super::fetcher::clock_seed;
use super::state::{ServiceCommand, ServiceState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Wake interval of the service thread
pub const TICK: Duration = Duration::from_secs(1);

/// Fetch budget of a background update pass
pub const BACKGROUND_TIMEOUT: Duration = Duration::from_secs(60);

/// Countdown to the next index request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NextIndexRequest {
    /// `None` when nothing is scheduled
    pub seconds_until_update: Option<u64>,
}

/// What a wake-up did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Exit,
    Idle,
    Updated,
}

impl UpdaterContext {
    /// Schedule the next index request: a uniform draw from the jitter
    /// window, plus the polling interval when asked.
    pub(crate) fn schedule_request(&mut self, include_poll_interval: bool) {
        let mut rng = StdRng::seed_from_u64(clock_seed());
        let mut delay = rng.gen_range(0..self.update_window);
        if include_poll_interval {
            delay += self.poll_interval;
        }
        self.next_index_request.seconds_until_update = Some(delay);
        debug!("Next index request in {}s", delay);
    }

    /// Schedule for a triggered request, never later than what is planned
    fn schedule_triggered(&mut self) {
        let planned = self.next_index_request.seconds_until_update;
        self.schedule_request(false);
        if let (Some(planned), Some(drawn)) = (planned, self.next_index_request.seconds_until_update)
        {
            self.next_index_request.seconds_until_update = Some(planned.min(drawn));
        }
    }

    /// Prepare the first schedule before the thread starts
    pub(crate) fn prepare_start(&mut self) {
        if self.polling_enabled() {
            self.schedule_request(true);
        }
        self.publish();
    }

    /// One wake of the service loop; `elapsed_secs` is the time since the
    /// previous countdown step.
    pub(crate) fn tick(&mut self, elapsed_secs: u64) -> TickOutcome {
        if self.shared.state() == ServiceState::Dying {
            self.next_index_request.seconds_until_update = None;
            self.publish();
            self.shared.set_state(ServiceState::Uninitialized);
            return TickOutcome::Exit;
        }

        self.absorb_corruption();
        if self.update_request_issued {
            self.update_request_issued = false;
            self.schedule_triggered();
        }

        let Some(remaining) = self.next_index_request.seconds_until_update else {
            return TickOutcome::Idle;
        };
        let remaining = remaining.saturating_sub(elapsed_secs);
        if remaining > 0 {
            self.next_index_request.seconds_until_update = Some(remaining);
            self.publish();
            return TickOutcome::Idle;
        }

        self.run_scheduled_update();
        TickOutcome::Updated
    }

    fn run_scheduled_update(&mut self) {
        self.next_index_request.seconds_until_update = None;
        self.in_progress = true;
        self.publish();

        let deadline = Instant::now() + BACKGROUND_TIMEOUT;
        self.request_update(true, true, true, deadline);

        self.in_progress = false;
        if self.polling_enabled() {
            self.schedule_request(true);
        }
        self.publish();
    }
}

/// Service thread body
pub(crate) fn run(mut ctx: UpdaterContext) {
    info!(
        "Updater service started (window {}s, poll interval {}s)",
        ctx.update_window, ctx.poll_interval
    );
    let mut next_wake = Instant::now() + TICK;

    loop {
        let wait = next_wake.saturating_duration_since(Instant::now());
        let elapsed_secs = match ctx.commands.recv_timeout(wait) {
            Ok(ServiceCommand::Update) => {
                ctx.update_request_issued = true;
                0
            }
            Ok(ServiceCommand::Shutdown) => 0,
            Err(RecvTimeoutError::Timeout) => {
                next_wake += TICK;
                TICK.as_secs()
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Updater command channel closed");
                ctx.shared.set_state(ServiceState::Dying);
                0
            }
        };

        match ctx.tick(elapsed_secs) {
            TickOutcome::Exit => break,
            TickOutcome::Updated => next_wake = Instant::now() + TICK,
            TickOutcome::Idle => {}
        }
    }
    info!("Updater service stopped");
}
