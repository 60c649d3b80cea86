use super::{adopt, inet, live, retry, with_socket};
use crate::error::{Error, Result};
use crate::reactor::{Handle, HandleId, Interest, Reactor};
use crate::sched::Timeout;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::debug;

/// Largest UDP payload a single IPv4 message can carry.
pub const MAX_DATAGRAM: usize = 65_507;

/// A UDP socket. Every call moves exactly one whole message.
pub struct Datagram {
    handle: Option<Handle>,
}

impl Datagram {
    /// Creates a UDP socket bound to `addr`.
    pub fn open(reactor: &Reactor, addr: SocketAddr, allow_broadcast: bool) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::io("socket", e))?;
        if allow_broadcast {
            socket
                .set_broadcast(true)
                .map_err(|e| Error::io("setsockopt(SO_BROADCAST)", e))?;
        }
        socket
            .bind(&addr.into())
            .map_err(|e| Error::io("bind", e))?;

        let handle = adopt(reactor, socket)?;
        debug!("Datagram socket bound to {} as {:?}", addr, handle.id());
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Fixes the peer used by [`Datagram::send`] and filters what
    /// [`Datagram::recv`] sees.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        let handle = live(&self.handle)?;
        with_socket(handle, "connect", |s| s.connect(&addr.into()))
    }

    /// Sends `buf` as one datagram to `addr`.
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr, timeout: Timeout) -> Result<usize> {
        let handle = live(&self.handle)?;
        check_len(buf)?;
        let target = SockAddr::from(addr);
        retry(handle, Interest::Writable, timeout, "sendto", |s| {
            s.send_to(buf, &target)
        })
        .await
    }

    /// Sends `buf` as one datagram to the connected peer.
    pub async fn send(&self, buf: &[u8], timeout: Timeout) -> Result<usize> {
        let handle = live(&self.handle)?;
        check_len(buf)?;
        retry(handle, Interest::Writable, timeout, "send", |s| s.send(buf)).await
    }

    /// Receives one datagram and its sender.
    ///
    /// A datagram that does not fit in `buf` is consumed and reported as
    /// [`Error::DatagramTruncated`].
    pub async fn recv_from(&self, buf: &mut [u8], timeout: Timeout) -> Result<(usize, SocketAddr)> {
        let handle = live(&self.handle)?;
        let capacity = buf.len();
        let (len, from) = retry(handle, Interest::Readable, timeout, "recvfrom", |s| {
            s.recv_from_with_flags(as_uninit(buf), libc::MSG_TRUNC)
        })
        .await?;
        check_truncation(len, capacity)?;
        Ok((len, inet(from, "recvfrom")?))
    }

    /// Receives one datagram from the connected peer.
    pub async fn recv(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        let handle = live(&self.handle)?;
        let capacity = buf.len();
        let len = retry(handle, Interest::Readable, timeout, "recv", |s| {
            s.recv_with_flags(as_uninit(buf), libc::MSG_TRUNC)
        })
        .await?;
        check_truncation(len, capacity)?;
        Ok(len)
    }

    /// Locally bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let handle = live(&self.handle)?;
        inet(with_socket(handle, "getsockname", |s| s.local_addr())?, "getsockname")
    }

    /// The underlying handle, while open.
    pub fn id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(Handle::id)
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Closes the socket. Does nothing if already closed.
    pub fn close(&mut self) {
        self.handle.take();
    }
}

fn check_len(buf: &[u8]) -> Result<()> {
    if buf.len() > MAX_DATAGRAM {
        return Err(Error::DatagramTooLarge {
            len: buf.len(),
            max: MAX_DATAGRAM,
        });
    }
    Ok(())
}

fn check_truncation(len: usize, capacity: usize) -> Result<()> {
    if len > capacity {
        return Err(Error::DatagramTruncated { len, capacity });
    }
    Ok(())
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: initialised bytes are valid `MaybeUninit<u8>` and the kernel
    // only ever writes initialised data into the slice.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

impl AsRawFd for Datagram {
    fn as_raw_fd(&self) -> RawFd {
        self.handle
            .as_ref()
            .and_then(|h| h.fd().ok())
            .unwrap_or(-1)
    }
}

impl fmt::Debug for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datagram").field("handle", &self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ReactorConfig;
    use crate::sched::LocalScheduler;
    use std::rc::Rc;
    use std::time::Duration;

    fn setup() -> (LocalScheduler, Reactor, Datagram, Datagram) {
        let sched = LocalScheduler::default();
        let reactor = Reactor::new(ReactorConfig::default(), Rc::new(sched.clone())).unwrap();
        let any = "127.0.0.1:0".parse().unwrap();
        let a = Datagram::open(&reactor, any, false).unwrap();
        let b = Datagram::open(&reactor, any, false).unwrap();
        (sched, reactor, a, b)
    }

    fn soon() -> Timeout {
        Timeout::after(Duration::from_secs(5))
    }

    #[test]
    fn test_messages_keep_their_boundaries() {
        let (sched, _reactor, a, b) = setup();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let (first, second, from) = sched.block_on(async {
            a.send_to(b"one", b_addr, soon()).await.unwrap();
            a.send_to(b"two!", b_addr, soon()).await.unwrap();

            let mut buf = [0u8; 64];
            let (n, from) = b.recv_from(&mut buf, soon()).await.unwrap();
            let first = buf[..n].to_vec();
            let (n, _) = b.recv_from(&mut buf, soon()).await.unwrap();
            (first, buf[..n].to_vec(), from)
        });

        assert_eq!(first, b"one");
        assert_eq!(second, b"two!");
        assert_eq!(from, a_addr);
    }

    #[test]
    fn test_connected_send_and_recv() {
        let (sched, _reactor, a, b) = setup();
        a.connect(b.local_addr().unwrap()).unwrap();
        b.connect(a.local_addr().unwrap()).unwrap();

        let reply = sched.block_on(async {
            a.send(b"ping", soon()).await.unwrap();
            let mut buf = [0u8; 8];
            let n = b.recv(&mut buf, soon()).await.unwrap();
            b.send(&buf[..n], soon()).await.unwrap();
            let n = a.recv(&mut buf, soon()).await.unwrap();
            buf[..n].to_vec()
        });
        assert_eq!(reply, b"ping");
    }

    #[test]
    fn test_oversized_and_truncated_datagrams() {
        let (sched, _reactor, a, b) = setup();
        let b_addr = b.local_addr().unwrap();

        let (too_large, truncated, after) = sched.block_on(async {
            let big = vec![0u8; MAX_DATAGRAM + 1];
            let too_large = a.send_to(&big, b_addr, soon()).await;

            a.send_to(b"0123456789", b_addr, soon()).await.unwrap();
            a.send_to(b"ok", b_addr, soon()).await.unwrap();
            let mut small = [0u8; 4];
            let truncated = b.recv_from(&mut small, soon()).await;
            let after = b.recv_from(&mut small, soon()).await.map(|(n, _)| small[..n].to_vec());
            (too_large, truncated, after)
        });

        assert!(matches!(
            too_large,
            Err(Error::DatagramTooLarge { max: MAX_DATAGRAM, .. })
        ));
        assert!(matches!(
            truncated,
            Err(Error::DatagramTruncated {
                len: 10,
                capacity: 4
            })
        ));
        assert_eq!(after.unwrap(), b"ok");
    }

    #[test]
    fn test_recv_times_out() {
        let (sched, _reactor, _a, b) = setup();
        let result = sched.block_on(async {
            let mut buf = [0u8; 8];
            b.recv_from(&mut buf, Timeout::after(Duration::from_millis(20)))
                .await
        });
        assert!(matches!(result, Err(Error::TimedOut)));
    }
}
