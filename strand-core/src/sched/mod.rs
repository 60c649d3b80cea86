//! Fiber scheduling interface.
//!
//! This module is responsible for:
//! - The contract the reactor needs from a cooperative scheduler
//! - Deadline values passed into every blocking call
//! - A bundled single-threaded scheduler implementing the contract

mod local;

pub use local::{LocalScheduler, SchedulerConfig};

use futures::future::LocalBoxFuture;
use std::future::poll_fn;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

/// A poll routine the scheduler calls periodically or when it goes idle.
///
/// The argument is the longest the routine may block waiting for the OS.
/// Periodic pollers are always handed `Duration::ZERO`.
pub type Poller = Box<dyn FnMut(Duration)>;

/// What the reactor needs from the scheduler that runs its fibers.
///
/// A fiber is a `'static` future and its suspension token is the [`Waker`]
/// it was polled with. Everything runs on one thread.
pub trait FiberScheduler {
    /// Queues a new fiber.
    fn spawn(&self, fiber: LocalBoxFuture<'static, ()>);

    /// Wakes `waker` once `deadline` has passed.
    fn wake_at(&self, deadline: Instant, waker: Waker) -> TimerId;

    /// Withdraws a pending wakeup. Does nothing if it already fired.
    fn cancel_wake(&self, timer: TimerId);

    /// Registers a poll routine.
    ///
    /// With `idle_fallback` set the routine replaces the scheduler's own idle
    /// sleep and `interval` is ignored; otherwise it runs every `interval`.
    fn register_poller(&self, poller: Poller, interval: Duration, idle_fallback: bool);
}

/// Names one [`FiberScheduler::wake_at`] registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId {
    deadline: Instant,
    seq: u64,
}

impl TimerId {
    /// `seq` must be unique among the scheduler's timers sharing `deadline`.
    pub fn new(deadline: Instant, seq: u64) -> Self {
        Self { deadline, seq }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// A deadline wakeup that is withdrawn when dropped.
pub(crate) struct ArmedTimer<'a> {
    scheduler: &'a dyn FiberScheduler,
    timer: Option<TimerId>,
}

impl<'a> ArmedTimer<'a> {
    pub(crate) fn new(scheduler: &'a dyn FiberScheduler) -> Self {
        Self {
            scheduler,
            timer: None,
        }
    }

    /// Registers the wakeup on first call; later calls keep it.
    pub(crate) fn arm(&mut self, deadline: Instant, waker: &Waker) {
        if self.timer.is_none() {
            self.timer = Some(self.scheduler.wake_at(deadline, waker.clone()));
        }
    }
}

impl Drop for ArmedTimer<'_> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.scheduler.cancel_wake(timer);
        }
    }
}

/// Why a suspended fiber was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The descriptor reported readiness.
    Woken,
    /// The deadline passed first.
    TimedOut,
}

/// Absolute deadline for a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Wait for as long as it takes.
    #[default]
    Never,
    /// Give up at this instant.
    At(Instant),
}

impl Timeout {
    /// A deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self::At(Instant::now() + duration)
    }

    /// The deadline, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Self::Never => None,
            Self::At(at) => Some(*at),
        }
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        match self {
            Self::Never => false,
            Self::At(at) => Instant::now() >= *at,
        }
    }

    /// Time left until the deadline; `None` when infinite.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Suspends the calling fiber for `duration`.
pub async fn sleep(scheduler: &dyn FiberScheduler, duration: Duration) {
    let deadline = Instant::now() + duration;
    let mut timer = ArmedTimer::new(scheduler);
    poll_fn(|cx| {
        if Instant::now() >= deadline {
            return Poll::Ready(());
        }
        timer.arm(deadline, cx.waker());
        Poll::Pending
    })
    .await
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        match duration {
            Some(d) => Self::after(d),
            None => Self::Never,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::after(duration)
    }
}
