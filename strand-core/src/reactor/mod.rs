//! Readiness multiplexer and handle bookkeeping
//!
//! This module is responsible for:
//! - Owning the single epoll instance and the fixed-size handle arena
//! - Registering descriptors (forced non-blocking, edge-triggered)
//! - Polling the kernel and dispatching readiness to fibers or callbacks
//!
//! Callbacks are invoked synchronously from inside [`Reactor::poll`]. They
//! run on the scheduler thread while every fiber is parked, so a callback
//! that blocks stalls the whole process.

mod arena;
mod config;
mod handle;
mod poll_mode;

pub use config::ReactorConfig;
pub use handle::{Callback, Handle, HandleId, Interest, Readiness};
pub use poll_mode::{PollMode, DEFAULT_POLL_INTERVAL};

use crate::error::{Error, Result};
use crate::sched::FiberScheduler;
use crate::watch::{FsWatchState, SignalWatchState};
use arena::HandleArena;
use handle::Waiter;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use std::cell::{RefCell, RefMut};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Bits every descriptor is registered for.
fn watch_flags() -> EpollFlags {
    EpollFlags::EPOLLET | EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT | EpollFlags::EPOLLRDHUP
}

struct Inner {
    epoll_fd: RawFd,
    config: ReactorConfig,
    arena: RefCell<HandleArena>,
    events: RefCell<Vec<EpollEvent>>,
    scheduler: Rc<dyn FiberScheduler>,
    fs_watch: Rc<RefCell<FsWatchState>>,
    signal_watch: Rc<RefCell<SignalWatchState>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Whatever is still open here belongs to watchers nobody closed.
        for fd in self.arena.get_mut().open_fds() {
            let _ = nix::unistd::close(fd);
        }
        if let Err(err) = nix::unistd::close(self.epoll_fd) {
            warn!("Failed to close epoll fd {}: {}", self.epoll_fd, err);
        }
    }
}

/// The reactor context: one epoll instance, one handle arena, one of each
/// watcher. Cloning yields another reference to the same reactor.
///
/// Everything here is confined to the scheduler thread.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    /// Creates the epoll instance and hooks [`Reactor::poll`] into
    /// `scheduler` according to `config.poll_mode`.
    pub fn new(config: ReactorConfig, scheduler: Rc<dyn FiberScheduler>) -> Result<Self> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::sys("epoll_create1", e))?;

        let reactor = Self {
            inner: Rc::new(Inner {
                epoll_fd,
                arena: RefCell::new(HandleArena::with_capacity(config.max_handles)),
                events: RefCell::new(vec![EpollEvent::empty(); config.poll_batch.max(1)]),
                scheduler,
                fs_watch: Rc::new(RefCell::new(FsWatchState::default())),
                signal_watch: Rc::new(RefCell::new(SignalWatchState::default())),
                config,
            }),
        };

        let mode = reactor.inner.config.poll_mode;
        let weak: Weak<Inner> = Rc::downgrade(&reactor.inner);
        reactor.inner.scheduler.register_poller(
            Box::new(move |max_wait| {
                if let Some(inner) = weak.upgrade() {
                    if let Err(err) = (Reactor { inner }).poll(max_wait) {
                        error!("Reactor poll failed: {}", err);
                    }
                }
            }),
            mode.interval(),
            mode.is_idle_fallback(),
        );
        debug!("Reactor started: {}", mode.description());

        Ok(reactor)
    }

    /// Configuration the reactor was created with.
    pub fn config(&self) -> &ReactorConfig {
        &self.inner.config
    }

    /// The scheduler driving this reactor's fibers.
    pub fn scheduler(&self) -> &Rc<dyn FiberScheduler> {
        &self.inner.scheduler
    }

    /// Suspends the calling fiber for `duration`.
    pub async fn sleep(&self, duration: Duration) {
        crate::sched::sleep(self.inner.scheduler.as_ref(), duration).await
    }

    /// Handles currently allocated from the arena.
    pub fn live_handles(&self) -> usize {
        self.inner.arena.borrow().live()
    }

    pub(crate) fn arena_mut(&self) -> RefMut<'_, HandleArena> {
        self.inner.arena.borrow_mut()
    }

    pub(crate) fn fs_watch_state(&self) -> &Rc<RefCell<FsWatchState>> {
        &self.inner.fs_watch
    }

    pub(crate) fn signal_watch_state(&self) -> &Rc<RefCell<SignalWatchState>> {
        &self.inner.signal_watch
    }

    /// Takes ownership of `fd`, makes it non-blocking and adds it to the
    /// epoll set. On failure the descriptor is closed.
    ///
    /// # Panics
    ///
    /// If `fd` already belongs to an open handle. Nothing is closed in that
    /// case.
    pub fn register_fd(&self, fd: RawFd) -> Result<HandleId> {
        let id = match self.inner.arena.borrow_mut().alloc(fd) {
            Ok(id) => id,
            Err(err) => {
                let _ = nix::unistd::close(fd);
                return Err(err);
            }
        };

        if let Err(err) = self.add_to_epoll(id, fd) {
            if let Some(state) = self.inner.arena.borrow_mut().get_mut(id) {
                state.fd = -1;
            }
            self.inner.arena.borrow_mut().release(id);
            let _ = nix::unistd::close(fd);
            return Err(err);
        }
        Ok(id)
    }

    fn add_to_epoll(&self, id: HandleId, fd: RawFd) -> Result<()> {
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::sys("fcntl", e))?;
        let flags = OFlag::from_bits_truncate(flags);
        if !flags.contains(OFlag::O_NONBLOCK) {
            fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
                .map_err(|e| Error::sys("fcntl", e))?;
        }

        let mut event = EpollEvent::new(watch_flags(), id.to_token());
        match epoll_ctl(self.inner.epoll_fd, EpollOp::EpollCtlAdd, fd, &mut event) {
            Ok(()) => {
                if let Some(state) = self.inner.arena.borrow_mut().get_mut(id) {
                    state.in_epoll = true;
                }
                trace!("Registered fd {} as {:?}", fd, id);
                Ok(())
            }
            // Regular files cannot be watched and are always ready.
            Err(Errno::EPERM) => {
                if let Some(state) = self.inner.arena.borrow_mut().get_mut(id) {
                    state.events = EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT;
                }
                trace!("fd {} is not pollable, latched ready as {:?}", fd, id);
                Ok(())
            }
            Err(Errno::EEXIST) => panic!("fd {} is already in the epoll set", fd),
            Err(err) => Err(Error::sys("epoll_ctl", err)),
        }
    }

    /// Waits up to `timeout` for kernel events and dispatches them.
    ///
    /// Returns the number of events collected. Callbacks run before this
    /// returns; suspended fibers are only woken.
    pub fn poll(&self, timeout: Duration) -> Result<usize> {
        let mut events = std::mem::take(&mut *self.inner.events.borrow_mut());
        if events.is_empty() {
            // Re-entered from a callback; the outer poll owns the buffer.
            warn!("Nested reactor poll ignored");
            return Ok(0);
        }

        let timeout_ms = timeout.as_nanos().div_ceil(1_000_000).min(isize::MAX as u128) as isize;
        let ready = match epoll_wait(self.inner.epoll_fd, &mut events, timeout_ms) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(err) => {
                *self.inner.events.borrow_mut() = events;
                return Err(Error::sys("epoll_wait", err));
            }
        };

        for event in &events[..ready] {
            let id = HandleId::from_token(event.data());
            if self.fd(id).is_none() {
                // Closed earlier in this batch.
                trace!("Dropping event for stale {:?}", id);
                continue;
            }
            self.invoke(id, event.events());
        }

        *self.inner.events.borrow_mut() = events;
        Ok(ready)
    }

    /// Latches `events` on the handle and notifies its waiter.
    pub(crate) fn invoke(&self, id: HandleId, events: EpollFlags) {
        enum Action {
            Nothing,
            Wake(std::task::Waker),
            Call(Callback),
        }

        let action = {
            let mut arena = self.inner.arena.borrow_mut();
            let state = match arena.get_mut(id) {
                Some(state) => state,
                None => panic!("invoke on released handle {:?}", id),
            };
            assert!(state.fd >= 0, "invoke on closed handle {:?}", id);
            state.events |= events;
            match std::mem::replace(&mut state.waiter, Waiter::None) {
                Waiter::None => Action::Nothing,
                Waiter::Fiber(waker) => Action::Wake(waker),
                Waiter::Callback(callback) => {
                    state.waiter = Waiter::Callback(callback.clone());
                    Action::Call(callback)
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Wake(waker) => waker.wake(),
            Action::Call(callback) => callback(self, id),
        }
    }

    /// The descriptor behind `id`, if the handle is still open.
    pub fn fd(&self, id: HandleId) -> Option<RawFd> {
        self.inner
            .arena
            .borrow()
            .get(id)
            .map(|state| state.fd)
            .filter(|fd| *fd >= 0)
    }

    /// Latched readiness bits; empty for unknown handles.
    pub fn events(&self, id: HandleId) -> EpollFlags {
        self.inner
            .arena
            .borrow()
            .get(id)
            .map(|state| state.events)
            .unwrap_or_else(EpollFlags::empty)
    }

    /// Clears latched bits so the next would-block goes back to the kernel.
    ///
    /// Descriptors epoll refused stay ready.
    pub fn clear_events(&self, id: HandleId, bits: EpollFlags) {
        if let Some(state) = self.inner.arena.borrow_mut().get_mut(id) {
            if state.in_epoll {
                state.events.remove(bits);
            }
        }
    }

    /// Switches `id` to callback mode; see [`Callback`].
    ///
    /// # Panics
    ///
    /// If the handle is closed or a fiber is parked on it.
    pub fn set_callback(&self, id: HandleId, callback: Callback) {
        let mut arena = self.inner.arena.borrow_mut();
        let state = match arena.get_mut(id) {
            Some(state) if state.fd >= 0 => state,
            _ => panic!("callback attached to closed handle {:?}", id),
        };
        state.waiter.set_callback(id, callback);
    }

    /// Returns `id` to having no waiter. Unknown ids are ignored.
    pub fn clear_callback(&self, id: HandleId) {
        if let Some(state) = self.inner.arena.borrow_mut().get_mut(id) {
            state.waiter.clear_callback();
        }
    }

    /// Adds a reference that keeps the slot alive past `close`.
    pub(crate) fn retain(&self, id: HandleId) {
        let mut arena = self.inner.arena.borrow_mut();
        match arena.get_mut(id) {
            Some(state) => state.refs += 1,
            None => panic!("retain of released handle {:?}", id),
        }
    }

    /// Drops a reference; the slot returns to the arena once the handle is
    /// closed and unreferenced.
    pub(crate) fn release_ref(&self, id: HandleId) {
        let mut arena = self.inner.arena.borrow_mut();
        let done = match arena.get_mut(id) {
            Some(state) => {
                state.refs = state.refs.saturating_sub(1);
                state.refs == 0 && state.fd < 0
            }
            None => false,
        };
        if done {
            arena.release(id);
        }
    }

    /// Closes the descriptor and drops the owner's reference.
    ///
    /// A fiber parked on the handle is woken and sees it closed. Closing an
    /// already closed or released handle does nothing.
    pub(crate) fn close(&self, id: HandleId) {
        let (fd, in_epoll, waiter) = {
            let mut arena = self.inner.arena.borrow_mut();
            let Some(state) = arena.get_mut(id) else {
                return;
            };
            if state.fd < 0 {
                return;
            }
            let fd = std::mem::replace(&mut state.fd, -1);
            state.events = EpollFlags::empty();
            (fd, state.in_epoll, std::mem::replace(&mut state.waiter, Waiter::None))
        };

        if in_epoll {
            if let Err(err) = epoll_ctl(self.inner.epoll_fd, EpollOp::EpollCtlDel, fd, None) {
                debug!("epoll_ctl(DEL) on fd {} failed: {}", fd, err);
            }
        }
        if let Err(err) = nix::unistd::close(fd) {
            warn!("close({}) failed: {}", fd, err);
        }
        trace!("Closed fd {} ({:?})", fd, id);

        if let Waiter::Fiber(waker) = waiter {
            waker.wake();
        }
        self.release_ref(id);
    }
}
