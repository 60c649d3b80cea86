//! Strand Core - Non-blocking I/O for cooperatively scheduled fibers
//!
//! This library multiplexes descriptor readiness over a single epoll instance
//! and lets fibers (futures driven by a [`sched::FiberScheduler`]) park on
//! sockets, files, eventfds, inotify and signalfd without blocking the thread.

/// Error types
pub mod error;

/// Scheduler contract and the bundled single-threaded scheduler
pub mod sched;

/// Epoll multiplexer, handle arena and per-descriptor handles
pub mod reactor;

/// Filesystem and signal fan-out watchers
pub mod watch;

/// Socket transports
pub mod net;

/// File transport
pub mod disk;

/// Eventfd wakeup transport
pub mod wakeup;

/// Waiting on several handles at once
pub mod multi_wait;

pub use error::{Error, Result};
pub use multi_wait::MultiWait;
pub use reactor::{Handle, HandleId, Interest, PollMode, Reactor, ReactorConfig};
pub use sched::{FiberScheduler, LocalScheduler, Timeout, TimerId, WakeReason};
pub use wakeup::{Wakeup, WakeupNotifier};
