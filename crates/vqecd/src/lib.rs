//! VQE-C daemon library - exposes the updater for the binary and tests.

pub mod updater;

pub use updater::{Updater, UpdaterDeps, UpdaterError, UpdaterStatus};
