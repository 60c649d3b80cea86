//! Fan-out watchers.
//!
//! Each watcher wraps one shared kernel descriptor (inotify, signalfd) in a
//! single handle and demultiplexes what it reads into many subscriptions.
//! Delivery happens from a handle callback, i.e. inside the reactor's
//! dispatch loop, so subscription callbacks must not block.

mod fs;
mod signal;

pub use fs::{FsEvent, FsWatcher, WatchId, WatchMask};
pub use signal::{SignalWatcher, MAX_SIGNAL};

pub(crate) use fs::FsWatchState;
pub(crate) use signal::SignalWatchState;
