//! Cross-thread wakeup over a counting eventfd.
//!
//! [`Wakeup::wait`] parks a fiber until the counter is non-zero, then reads
//! and resets it. [`Wakeup::signal`] and [`WakeupNotifier::signal`] only
//! bump the counter, so they are safe from other threads and from signal
//! handlers.

use crate::error::{Error, Result};
use crate::reactor::{Handle, HandleId, Interest, Reactor};
use crate::sched::Timeout;
use nix::errno::Errno;
use nix::sys::eventfd::{eventfd, EfdFlags};
use std::fmt;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

fn bump(fd: RawFd) -> bool {
    loop {
        match nix::unistd::write(fd, &1u64.to_ne_bytes()) {
            Ok(_) => return true,
            Err(Errno::EINTR) => continue,
            // Counter saturated: a wakeup is pending anyway.
            Err(Errno::EAGAIN) => return true,
            Err(_) => return false,
        }
    }
}

/// Wakeup transport owned by the fiber that waits on it.
pub struct Wakeup {
    handle: Option<Handle>,
}

impl Wakeup {
    /// Creates a non-blocking eventfd with a zero counter.
    pub fn new(reactor: &Reactor) -> Result<Self> {
        let fd = eventfd(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(|e| Error::sys("eventfd", e))?;
        Ok(Self {
            handle: Some(Handle::register(reactor, fd)?),
        })
    }

    /// Increments the counter. Never suspends; returns false on failure or
    /// if the transport is closed.
    pub fn signal(&self) -> bool {
        match self.handle.as_ref().and_then(|h| h.fd().ok()) {
            Some(fd) => bump(fd),
            None => false,
        }
    }

    /// A cloneable sender for other threads.
    ///
    /// The notifier holds its own duplicate of the eventfd, so it stays
    /// valid after this transport is closed; signals sent then go nowhere.
    pub fn notifier(&self) -> Result<WakeupNotifier> {
        let raw = self.handle.as_ref().ok_or(Error::Closed)?.fd()?;
        // SAFETY: the handle keeps `raw` open for the duration of the borrow.
        let fd = unsafe { BorrowedFd::borrow_raw(raw) }
            .try_clone_to_owned()
            .map_err(|e| Error::io("dup", e))?;
        Ok(WakeupNotifier { fd: Arc::new(fd) })
    }

    /// Waits until the counter is non-zero, then returns it and resets it
    /// to zero.
    pub async fn wait(&self, timeout: Timeout) -> Result<u64> {
        let handle = self.handle.as_ref().ok_or(Error::Closed)?;
        let mut buf = [0u8; 8];
        loop {
            let fd = handle.fd()?;
            match nix::unistd::read(fd, &mut buf) {
                Ok(8) => return Ok(u64::from_ne_bytes(buf)),
                Ok(n) => panic!("eventfd read returned {} bytes", n),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    handle.clear_read();
                    handle.wait(Interest::Readable, timeout).await?;
                }
                Err(err) => return Err(Error::sys("read", err)),
            }
        }
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// The underlying handle, while open.
    pub fn id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(Handle::id)
    }

    /// Closes the eventfd. Does nothing if already closed.
    pub fn close(&mut self) {
        self.handle.take();
    }
}

impl AsRawFd for Wakeup {
    fn as_raw_fd(&self) -> RawFd {
        self.handle
            .as_ref()
            .and_then(|h| h.fd().ok())
            .unwrap_or(-1)
    }
}

impl fmt::Debug for Wakeup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wakeup").field("handle", &self.handle).finish()
    }
}

/// Thread-safe signalling end of a [`Wakeup`].
///
/// Clones share one duplicated descriptor, closed when the last clone drops.
#[derive(Debug, Clone)]
pub struct WakeupNotifier {
    fd: Arc<OwnedFd>,
}

impl WakeupNotifier {
    /// Increments the counter; see [`Wakeup::signal`].
    pub fn signal(&self) -> bool {
        bump(self.fd.as_raw_fd())
    }
}
