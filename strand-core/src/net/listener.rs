use super::{adopt, inet, live, with_socket, Stream};
use crate::error::{Error, Result};
use crate::reactor::{Handle, HandleId, Interest, Reactor};
use crate::sched::Timeout;
use nix::errno::Errno;
use nix::sys::socket::{accept4, SockFlag};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::debug;

/// A listening stream socket.
pub struct Listener {
    handle: Option<Handle>,
}

impl Listener {
    /// Creates a socket with `SO_REUSEADDR`, binds it to `addr` and starts
    /// listening.
    pub fn listen(reactor: &Reactor, addr: SocketAddr, backlog: i32) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::io("socket", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::io("setsockopt(SO_REUSEADDR)", e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::io("bind", e))?;
        socket
            .listen(backlog)
            .map_err(|e| Error::io("listen", e))?;

        let handle = adopt(reactor, socket)?;
        debug!("Listening on {} as {:?}", addr, handle.id());
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Waits for the next connection.
    pub async fn accept(&self, timeout: Timeout) -> Result<Stream> {
        let handle = live(&self.handle)?;
        loop {
            let fd = handle.fd()?;
            match accept4(fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
                Ok(conn) => return Stream::from_fd(handle.reactor(), conn),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    handle.clear_read();
                    handle.wait(Interest::Readable, timeout).await?;
                }
                Err(err) => return Err(Error::sys("accept4", err)),
            }
        }
    }

    /// Like [`Listener::accept`], also returning the peer's address.
    pub async fn accept_addr(&self, timeout: Timeout) -> Result<(Stream, SocketAddr)> {
        let stream = self.accept(timeout).await?;
        let peer = stream.peer_addr()?;
        Ok((stream, peer))
    }

    /// Locally bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let handle = live(&self.handle)?;
        let addr = with_socket(handle, "getsockname", |s| s.local_addr())?;
        inet(addr, "getsockname")
    }

    /// The underlying handle, while open.
    pub fn id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(Handle::id)
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Stops listening. Does nothing if already closed.
    pub fn close(&mut self) {
        self.handle.take();
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.handle
            .as_ref()
            .and_then(|h| h.fd().ok())
            .unwrap_or(-1)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("handle", &self.handle).finish()
    }
}
