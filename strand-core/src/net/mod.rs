//! Socket transports.
//!
//! This module provides:
//! - [`Listener`]: a bound, listening stream socket
//! - [`Stream`]: a connected byte stream (TCP, Unix domain or socket pair)
//! - [`Datagram`]: a UDP socket with per-message send and receive
//!
//! Every transport owns exactly one [`Handle`]. `close()` may be called any
//! number of times and dropping the transport closes it too. Would-block
//! results park the calling fiber on the handle until it is ready again or
//! the deadline passes.

mod datagram;
mod listener;
mod stream;

pub use datagram::{Datagram, MAX_DATAGRAM};
pub use listener::Listener;
pub use stream::Stream;

use crate::error::{Error, Result};
use crate::reactor::{Handle, Interest, Reactor};
use crate::sched::Timeout;
use socket2::{SockAddr, SockRef, Socket};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{BorrowedFd, IntoRawFd};

/// The handle of a transport that has not been closed.
pub(crate) fn live(handle: &Option<Handle>) -> Result<&Handle> {
    handle.as_ref().ok_or(Error::Closed)
}

/// Hands a freshly created socket over to the reactor.
pub(crate) fn adopt(reactor: &Reactor, socket: Socket) -> Result<Handle> {
    Handle::register(reactor, socket.into_raw_fd())
}

/// Runs a socket option or address query against the handle's descriptor.
pub(crate) fn with_socket<T>(
    handle: &Handle,
    op: &'static str,
    f: impl FnOnce(SockRef<'_>) -> io::Result<T>,
) -> Result<T> {
    let raw = handle.fd()?;
    // SAFETY: the handle keeps `raw` open for the duration of the borrow.
    let fd = unsafe { BorrowedFd::borrow_raw(raw) };
    f(SockRef::from(&fd)).map_err(|e| Error::io(op, e))
}

/// Repeats `attempt` until it stops reporting would-block, parking the
/// fiber on `interest` in between. Interrupted calls are retried at once.
pub(crate) async fn retry<T>(
    handle: &Handle,
    interest: Interest,
    timeout: Timeout,
    op: &'static str,
    mut attempt: impl FnMut(SockRef<'_>) -> io::Result<T>,
) -> Result<T> {
    loop {
        let raw = handle.fd()?;
        // SAFETY: as in `with_socket`.
        let fd = unsafe { BorrowedFd::borrow_raw(raw) };
        match attempt(SockRef::from(&fd)) {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                match interest {
                    Interest::Readable => handle.clear_read(),
                    Interest::Writable => handle.clear_write(),
                }
                handle.wait(interest, timeout).await?;
            }
            Err(e) => return Err(Error::io(op, e)),
        }
    }
}

/// Converts a socket address into an inet one.
pub(crate) fn inet(addr: SockAddr, op: &'static str) -> Result<SocketAddr> {
    addr.as_socket().ok_or_else(|| {
        Error::io(
            op,
            io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket"),
        )
    })
}
