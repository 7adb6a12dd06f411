//! Temporary real-time priority for short critical sections.
//!
//! The channel lineup swap holds the process-wide lock that the data path
//! also needs, so it runs under SCHED_FIFO and drops back on exit. Without the
//! privilege to change policy the section simply runs at normal priority.

/// Guard restoring the thread's scheduling policy on drop
pub struct ExpeditedSection {
    #[cfg(target_os = "linux")]
    previous: Option<(libc::c_int, libc::sched_param)>,
}

#[cfg(target_os = "linux")]
impl ExpeditedSection {
    pub fn enter() -> Self {
        use std::{io, mem};
        use tracing::debug;

        // SAFETY: pthread_self is always valid for the calling thread and the
        // out-parameters are plain C structs owned by this frame.
        unsafe {
            let thread = libc::pthread_self();
            let mut policy: libc::c_int = 0;
            let mut param: libc::sched_param = mem::zeroed();
            if libc::pthread_getschedparam(thread, &mut policy, &mut param) != 0 {
                return Self { previous: None };
            }

            let mut elevated: libc::sched_param = mem::zeroed();
            elevated.sched_priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
            let rc = libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &elevated);
            if rc != 0 {
                debug!(
                    "Running without priority elevation: {}",
                    io::Error::from_raw_os_error(rc)
                );
                return Self { previous: None };
            }
            Self {
                previous: Some((policy, param)),
            }
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.previous.is_some()
    }
}

#[cfg(target_os = "linux")]
impl Drop for ExpeditedSection {
    fn drop(&mut self) {
        if let Some((policy, param)) = self.previous.take() {
            // SAFETY: restores the values read in `enter` on the same thread.
            let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), policy, &param) };
            if rc != 0 {
                tracing::warn!(
                    "Failed to restore scheduling policy: {}",
                    std::io::Error::from_raw_os_error(rc)
                );
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl ExpeditedSection {
    pub fn enter() -> Self {
        Self {}
    }

    pub fn is_elevated(&self) -> bool {
        false
    }
}
