//! Signal watcher over a single signalfd.
//!
//! Registered signals are blocked for the scheduler thread and delivered as
//! records on the signalfd instead of through asynchronous handlers.

use crate::error::{Error, Result};
use crate::reactor::{HandleId, Reactor};
use nix::errno::Errno;
use nix::sys::epoll::EpollFlags;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{signalfd, SfdFlags, SIGNALFD_NEW};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, error};

/// Size of the handler table; signal numbers must be below this.
pub const MAX_SIGNAL: usize = 65;

const RECORD_LEN: usize = std::mem::size_of::<libc::signalfd_siginfo>();
const RECORDS_PER_READ: usize = 16;

type SignalHandler = Rc<dyn Fn(Signal)>;

/// Handler table shared between the reactor and the handle callback.
pub(crate) struct SignalWatchState {
    handle: Option<HandleId>,
    mask: SigSet,
    handlers: [Option<SignalHandler>; MAX_SIGNAL],
}

impl Default for SignalWatchState {
    fn default() -> Self {
        Self {
            handle: None,
            mask: SigSet::empty(),
            handlers: std::array::from_fn(|_| None),
        }
    }
}

/// Handle on the reactor's signal watcher.
#[derive(Clone)]
pub struct SignalWatcher {
    reactor: Reactor,
}

impl SignalWatcher {
    /// A handle on `reactor`'s signal watcher; opens nothing yet.
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            reactor: reactor.clone(),
        }
    }

    fn state(&self) -> &Rc<RefCell<SignalWatchState>> {
        self.reactor.signal_watch_state()
    }

    /// Whether the signalfd exists.
    pub fn is_open(&self) -> bool {
        self.state().borrow().handle.is_some()
    }

    /// Creates the signalfd for the current mask. Does nothing if already
    /// open.
    pub fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let fd = update_signalfd(SIGNALFD_NEW, &self.state().borrow().mask)?;
        let id = self.reactor.register_fd(fd)?;

        let state = self.state().clone();
        self.reactor.set_callback(
            id,
            Rc::new(move |reactor: &Reactor, id: HandleId| drain(reactor, id, &state)),
        );
        self.state().borrow_mut().handle = Some(id);
        debug!("Signal watcher opened on fd {}", fd);
        Ok(())
    }

    /// Routes `signal` to `handler`.
    ///
    /// # Panics
    ///
    /// If a handler for `signal` is already installed.
    pub fn register_signal<F>(&self, signal: Signal, handler: F) -> Result<()>
    where
        F: Fn(Signal) + 'static,
    {
        let signo = slot(signal);
        assert!(
            self.state().borrow().handlers[signo].is_none(),
            "{} registered twice",
            signal
        );
        self.open()?;

        let mut single = SigSet::empty();
        single.add(signal);
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&single), None)
            .map_err(|e| Error::sys("pthread_sigmask", e))?;

        let mut state = self.state().borrow_mut();
        let mut mask = state.mask;
        mask.add(signal);
        let fd = self.fd(&state)?;
        update_signalfd(fd, &mask)?;
        state.mask = mask;
        state.handlers[signo] = Some(Rc::new(handler));
        debug!("Watching {}", signal);
        Ok(())
    }

    /// Removes the handler for `signal` and unblocks it.
    ///
    /// # Panics
    ///
    /// If no handler is installed for `signal`.
    pub fn unregister_signal(&self, signal: Signal) -> Result<()> {
        let signo = slot(signal);
        let mut state = self.state().borrow_mut();
        assert!(
            state.handlers[signo].take().is_some(),
            "{} was never registered",
            signal
        );
        state.mask.remove(signal);
        if let Ok(fd) = self.fd(&state) {
            update_signalfd(fd, &state.mask)?;
        }
        drop(state);

        let mut single = SigSet::empty();
        single.add(signal);
        pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&single), None)
            .map_err(|e| Error::sys("pthread_sigmask", e))?;
        Ok(())
    }

    /// Whether a handler is installed for `signal`.
    pub fn is_registered(&self, signal: Signal) -> bool {
        self.state().borrow().handlers[slot(signal)].is_some()
    }

    /// Unregisters every signal and closes the signalfd.
    pub fn close(&self) -> Result<()> {
        let (handle, mask) = {
            let mut state = self.state().borrow_mut();
            state.handlers.iter_mut().for_each(|h| *h = None);
            (
                state.handle.take(),
                std::mem::replace(&mut state.mask, SigSet::empty()),
            )
        };
        if let Some(id) = handle {
            self.reactor.clear_callback(id);
            self.reactor.close(id);
            debug!("Signal watcher closed");
        }
        pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None)
            .map_err(|e| Error::sys("pthread_sigmask", e))
    }

    fn fd(&self, state: &SignalWatchState) -> Result<RawFd> {
        state
            .handle
            .and_then(|id| self.reactor.fd(id))
            .ok_or(Error::Closed)
    }
}

fn slot(signal: Signal) -> usize {
    let signo = signal as usize;
    assert!(signo < MAX_SIGNAL, "{} exceeds the handler table", signal);
    signo
}

/// Creates (`fd == SIGNALFD_NEW`) or retargets a signalfd.
fn update_signalfd(fd: RawFd, mask: &SigSet) -> Result<RawFd> {
    signalfd(fd, mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .map_err(|e| Error::sys("signalfd", e))
}

fn drain(reactor: &Reactor, id: HandleId, state: &Rc<RefCell<SignalWatchState>>) {
    let mut buf = [0u8; RECORD_LEN * RECORDS_PER_READ];
    loop {
        let Some(fd) = reactor.fd(id) else {
            return;
        };
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => return,
            Ok(n) => {
                for record in buf[..n].chunks_exact(RECORD_LEN) {
                    let signo = u32::from_ne_bytes([record[0], record[1], record[2], record[3]]);
                    deliver(signo as i32, state);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                reactor.clear_events(id, EpollFlags::EPOLLIN);
                return;
            }
            Err(err) => {
                error!("Reading signalfd {} failed: {}", fd, err);
                return;
            }
        }
    }
}

fn deliver(signo: i32, state: &Rc<RefCell<SignalWatchState>>) {
    let signal = match Signal::try_from(signo) {
        Ok(signal) => signal,
        Err(_) => panic!("signalfd delivered unknown signal number {}", signo),
    };
    let handler = state.borrow().handlers[slot(signal)].clone();
    match handler {
        Some(handler) => handler(signal),
        None => panic!("{} delivered without a registered handler", signal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorConfig;
    use crate::sched::LocalScheduler;
    use nix::sys::signal::raise;
    use std::cell::Cell;
    use std::time::{Duration, Instant};

    fn reactor() -> (LocalScheduler, Reactor) {
        let sched = LocalScheduler::default();
        let reactor = Reactor::new(ReactorConfig::default(), Rc::new(sched.clone())).unwrap();
        (sched, reactor)
    }

    #[test]
    fn test_raised_signal_reaches_handler() {
        let (sched, reactor) = reactor();
        let watcher = SignalWatcher::new(&reactor);
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        watcher
            .register_signal(Signal::SIGUSR2, move |signal| {
                assert_eq!(signal, Signal::SIGUSR2);
                h.set(h.get() + 1);
            })
            .unwrap();
        assert!(watcher.is_registered(Signal::SIGUSR2));

        let r = reactor.clone();
        let seen = hits.clone();
        sched.block_on(async move {
            // Blocked for this thread, so it queues on the signalfd.
            raise(Signal::SIGUSR2).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while seen.get() == 0 && Instant::now() < deadline {
                r.sleep(Duration::from_millis(5)).await;
            }
        });
        assert_eq!(hits.get(), 1);

        watcher.unregister_signal(Signal::SIGUSR2).unwrap();
        assert!(!watcher.is_registered(Signal::SIGUSR2));
        watcher.close().unwrap();
        assert_eq!(reactor.live_handles(), 0);
    }

    #[test]
    fn test_signalfd_mask_follows_registrations() {
        let (_sched, reactor) = reactor();
        let watcher = SignalWatcher::new(&reactor);
        watcher.register_signal(Signal::SIGURG, |_| {}).unwrap();
        let fd = watcher.fd(&watcher.state().borrow()).unwrap();
        assert!(watcher.state().borrow().mask.contains(Signal::SIGURG));

        // Retargeting keeps the same descriptor.
        watcher.register_signal(Signal::SIGTTIN, |_| {}).unwrap();
        assert_eq!(watcher.fd(&watcher.state().borrow()).unwrap(), fd);
        watcher.unregister_signal(Signal::SIGURG).unwrap();
        let mask = watcher.state().borrow().mask;
        assert!(!mask.contains(Signal::SIGURG) && mask.contains(Signal::SIGTTIN));

        watcher.close().unwrap();
        assert!(!watcher.is_open());
        assert_eq!(reactor.live_handles(), 0);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_panics() {
        let (_sched, reactor) = reactor();
        let watcher = SignalWatcher::new(&reactor);
        watcher.register_signal(Signal::SIGWINCH, |_| {}).unwrap();
        let _ = watcher.register_signal(Signal::SIGWINCH, |_| {});
    }

    #[test]
    #[should_panic(expected = "never registered")]
    fn test_unregister_unknown_panics() {
        let (_sched, reactor) = reactor();
        let watcher = SignalWatcher::new(&reactor);
        let _ = watcher.unregister_signal(Signal::SIGWINCH);
    }

    #[test]
    #[should_panic(expected = "without a registered handler")]
    fn test_delivery_without_handler_panics() {
        let state = Rc::new(RefCell::new(SignalWatchState::default()));
        deliver(libc::SIGUSR1, &state);
    }
}
