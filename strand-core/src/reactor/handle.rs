//! Per-descriptor multiplexing state.
//!
//! A handle latches the readiness bits the kernel reported for its fd and
//! holds at most one waiter: either a single suspended fiber or a persistent
//! callback. The two never coexist; the setters below panic if asked to.

use super::Reactor;
use crate::error::{Error, Result};
use crate::sched::{Timeout, TimerId, WakeReason};
use nix::sys::epoll::EpollFlags;
use std::fmt;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Callback run from inside the multiplexer's dispatch loop.
///
/// It runs synchronously on the scheduler thread and must never block or
/// await: every other fiber is stalled until it returns.
pub type Callback = Rc<dyn Fn(&Reactor, HandleId)>;

/// Identifies a handle slot. Stale ids (slot recycled) resolve to nothing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

impl HandleId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the id into epoll user data.
    pub(crate) fn to_token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub(crate) fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleId({}v{})", self.index, self.generation)
    }
}

/// The readiness a fiber waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    /// Reported bits that satisfy this interest. Hangups and errors satisfy
    /// both so the next syscall can report them.
    pub fn mask(&self) -> EpollFlags {
        match self {
            Self::Readable => {
                EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR
            }
            Self::Writable => EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
        }
    }
}

/// Who gets told when the handle becomes ready.
pub(crate) enum Waiter {
    None,
    /// Single-shot: cleared the moment the fiber is woken.
    Fiber(Waker),
    /// Level-triggered: stays until explicitly cleared.
    Callback(Callback),
}

impl Waiter {
    pub(crate) fn park_fiber(&mut self, id: HandleId, waker: &Waker) {
        match self {
            Self::Callback(_) => panic!("{:?} has a callback; a fiber cannot wait on it", id),
            Self::Fiber(current) if current.will_wake(waker) => {}
            _ => *self = Self::Fiber(waker.clone()),
        }
    }

    pub(crate) fn set_callback(&mut self, id: HandleId, callback: Callback) {
        if let Self::Fiber(_) = self {
            panic!("{:?} has a suspended fiber; cannot attach a callback", id);
        }
        *self = Self::Callback(callback);
    }

    pub(crate) fn clear_callback(&mut self) {
        if let Self::Callback(_) = self {
            *self = Self::None;
        }
    }

    pub(crate) fn clear_fiber(&mut self) {
        if let Self::Fiber(_) = self {
            *self = Self::None;
        }
    }

    pub(crate) fn is_fiber(&self) -> bool {
        matches!(self, Self::Fiber(_))
    }

    pub(crate) fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }
}

/// Slot payload stored in the arena.
pub(crate) struct HandleState {
    /// Negative once closed.
    pub(crate) fd: RawFd,
    pub(crate) events: EpollFlags,
    /// The owner holds one reference; multi-wait membership holds another.
    pub(crate) refs: u32,
    pub(crate) waiter: Waiter,
    /// False for descriptors epoll refused (regular files).
    pub(crate) in_epoll: bool,
}

impl HandleState {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            events: EpollFlags::empty(),
            refs: 1,
            waiter: Waiter::None,
            in_epoll: false,
        }
    }
}

/// Exclusive owner of one registered descriptor.
///
/// Dropping the handle closes the descriptor, exactly like an explicit
/// close by the owning transport; a handle cannot be cloned.
pub struct Handle {
    reactor: Reactor,
    id: HandleId,
}

impl Handle {
    pub(crate) fn new(reactor: Reactor, id: HandleId) -> Self {
        Self { reactor, id }
    }

    /// Registers `fd` with `reactor` and takes ownership of it.
    pub fn register(reactor: &Reactor, fd: RawFd) -> Result<Self> {
        let id = reactor.register_fd(fd)?;
        Ok(Self::new(reactor.clone(), id))
    }

    /// Arena slot of this handle.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The reactor the descriptor is registered with.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// The descriptor, or [`Error::Closed`] if it was closed underneath us.
    pub fn fd(&self) -> Result<RawFd> {
        self.reactor.fd(self.id).ok_or(Error::Closed)
    }

    /// Bits reported since they were last cleared.
    pub fn events(&self) -> EpollFlags {
        self.reactor.events(self.id)
    }

    /// Whether the latched bits satisfy [`Interest::Readable`].
    pub fn is_readable(&self) -> bool {
        self.events().intersects(Interest::Readable.mask())
    }

    /// Whether the latched bits satisfy [`Interest::Writable`].
    pub fn is_writable(&self) -> bool {
        self.events().intersects(Interest::Writable.mask())
    }

    /// Forgets the latched read bit after a read hit would-block.
    pub fn clear_read(&self) {
        self.reactor.clear_events(self.id, EpollFlags::EPOLLIN);
    }

    /// Forgets the latched write bit after a write hit would-block.
    pub fn clear_write(&self) {
        self.reactor.clear_events(self.id, EpollFlags::EPOLLOUT);
    }

    /// Suspends the calling fiber until the handle reports `interest` or
    /// `timeout` passes.
    pub fn ready(&self, interest: Interest, timeout: Timeout) -> Readiness {
        Readiness::new(self.reactor.clone(), self.id, interest, timeout)
    }

    /// Like [`Handle::ready`] but maps expiry to [`Error::TimedOut`].
    pub async fn wait(&self, interest: Interest, timeout: Timeout) -> Result<()> {
        match self.ready(interest, timeout).await {
            WakeReason::Woken => Ok(()),
            WakeReason::TimedOut => Err(Error::TimedOut),
        }
    }

    /// Attaches a persistent callback, see [`Callback`].
    pub fn set_callback(&self, callback: Callback) {
        self.reactor.set_callback(self.id, callback);
    }

    /// Detaches the callback, if any.
    pub fn clear_callback(&self) {
        self.reactor.clear_callback(self.id);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("fd", &self.reactor.fd(self.id))
            .finish()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.reactor.close(self.id);
    }
}

/// Future returned by [`Handle::ready`].
///
/// Dropping it before completion (or letting it time out) leaves the handle
/// with no waiter, so it stays usable.
pub struct Readiness {
    reactor: Reactor,
    id: HandleId,
    interest: Interest,
    timeout: Timeout,
    parked: bool,
    timer: Option<TimerId>,
}

impl Readiness {
    pub(crate) fn new(reactor: Reactor, id: HandleId, interest: Interest, timeout: Timeout) -> Self {
        Self {
            reactor,
            id,
            interest,
            timeout,
            parked: false,
            timer: None,
        }
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.reactor.scheduler().cancel_wake(timer);
        }
    }
}

impl Future for Readiness {
    type Output = WakeReason;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let id = this.id;
        let mut arena = this.reactor.arena_mut();
        let reason = match arena.get_mut(id) {
            Some(state) if state.fd >= 0 => {
                if state.events.intersects(this.interest.mask()) {
                    // Any event wakes the fiber; it only resumes once its
                    // interest is met.
                    if this.parked {
                        state.waiter.clear_fiber();
                    }
                    Some(WakeReason::Woken)
                } else if this.timeout.expired() {
                    state.waiter.clear_fiber();
                    Some(WakeReason::TimedOut)
                } else {
                    state.waiter.park_fiber(id, cx.waker());
                    None
                }
            }
            _ => {
                assert!(this.parked, "fiber suspended on closed handle {:?}", id);
                // Closed while parked; the caller's next call reports it.
                Some(WakeReason::Woken)
            }
        };
        drop(arena);

        if let Some(reason) = reason {
            this.parked = false;
            this.disarm();
            return Poll::Ready(reason);
        }
        if !this.parked {
            this.parked = true;
            if let Some(deadline) = this.timeout.deadline() {
                this.timer = Some(this.reactor.scheduler().wake_at(deadline, cx.waker().clone()));
            }
        }
        Poll::Pending
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        if self.parked {
            if let Some(state) = self.reactor.arena_mut().get_mut(self.id) {
                state.waiter.clear_fiber();
            }
        }
        self.disarm();
    }
}
