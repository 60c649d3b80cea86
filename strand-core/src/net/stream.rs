use super::{adopt, inet, live, with_socket};
use crate::error::{Error, Result};
use crate::reactor::{Handle, HandleId, Interest, Reactor};
use crate::sched::Timeout;
use nix::errno::Errno;
use nix::sys::socket::{recv, send, MsgFlags};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::{debug, trace};

/// A connected byte stream.
pub struct Stream {
    handle: Option<Handle>,
}

impl Stream {
    /// Wraps an already connected descriptor.
    pub fn from_fd(reactor: &Reactor, fd: RawFd) -> Result<Self> {
        let handle = Handle::register(reactor, fd)?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Connects to `addr`, waiting at most until `timeout` for the handshake.
    pub async fn connect_tcp(
        reactor: &Reactor,
        addr: SocketAddr,
        timeout: Timeout,
        nodelay: bool,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::io("socket", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::io("fcntl", e))?;
        if nodelay {
            socket
                .set_nodelay(true)
                .map_err(|e| Error::io("setsockopt(TCP_NODELAY)", e))?;
        }

        let pending = match socket.connect(&addr.into()) {
            Ok(()) => false,
            Err(e) if matches!(e.raw_os_error(), Some(libc::EINPROGRESS) | Some(libc::EINTR)) => {
                true
            }
            Err(e) => return Err(Error::io("connect", e)),
        };

        let handle = adopt(reactor, socket)?;
        if pending {
            handle.wait(Interest::Writable, timeout).await?;
            if let Some(err) = with_socket(&handle, "getsockopt(SO_ERROR)", |s| s.take_error())? {
                return Err(Error::io("connect", err));
            }
        }
        debug!("Connected to {} as {:?}", addr, handle.id());
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Connects to a Unix domain socket at `path`.
    pub fn connect_unix(reactor: &Reactor, path: impl AsRef<Path>) -> Result<Self> {
        let addr = SockAddr::unix(path).map_err(|e| Error::io("sockaddr_un", e))?;
        let socket =
            Socket::new(Domain::UNIX, Type::STREAM, None).map_err(|e| Error::io("socket", e))?;
        socket
            .connect(&addr)
            .map_err(|e| Error::io("connect", e))?;
        Ok(Self {
            handle: Some(adopt(reactor, socket)?),
        })
    }

    /// Two streams connected to each other.
    pub fn pair(reactor: &Reactor) -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair().map_err(|e| Error::io("socketpair", e))?;
        let a = Self::from_fd(reactor, a.into_raw_fd());
        let b = Self::from_fd(reactor, b.into_raw_fd());
        Ok((a?, b?))
    }

    /// Reads into `buf` until it is full or the peer closes.
    ///
    /// With `eager` set the call returns as soon as some bytes arrived and the
    /// socket would block. Returns the number of bytes read, which is short
    /// only on end of stream, an eager return or a timeout after partial data.
    pub async fn recv(&self, buf: &mut [u8], eager: bool, timeout: Timeout) -> Result<usize> {
        let handle = live(&self.handle)?;
        let chunk = handle.reactor().config().io_chunk_size.max(1);
        let mut got = 0;

        while got < buf.len() {
            let fd = handle.fd()?;
            let end = buf.len().min(got + chunk);
            match recv(fd, &mut buf[got..end], MsgFlags::empty()) {
                Ok(0) => {
                    trace!("{:?} reached end of stream after {} bytes", handle.id(), got);
                    break;
                }
                Ok(n) => got += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    handle.clear_read();
                    if eager && got > 0 {
                        break;
                    }
                    match handle.wait(Interest::Readable, timeout).await {
                        Ok(()) => {}
                        Err(Error::TimedOut) if got > 0 => break,
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(Error::sys("recv", err)),
            }
        }
        Ok(got)
    }

    /// Writes all of `buf`.
    ///
    /// # Panics
    ///
    /// If the kernel reports a zero-length write without an error.
    pub async fn send(&self, buf: &[u8], timeout: Timeout) -> Result<usize> {
        let handle = live(&self.handle)?;
        let chunk = handle.reactor().config().io_chunk_size.max(1);
        let mut sent = 0;

        while sent < buf.len() {
            let fd = handle.fd()?;
            let end = buf.len().min(sent + chunk);
            match send(fd, &buf[sent..end], MsgFlags::MSG_NOSIGNAL) {
                Ok(0) => panic!("send on {:?} wrote nothing and reported no error", handle.id()),
                Ok(n) => sent += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    handle.clear_write();
                    handle.wait(Interest::Writable, timeout).await?;
                }
                Err(err) => return Err(Error::sys("send", err)),
            }
        }
        Ok(sent)
    }

    /// Fills `buf` completely or fails with [`Error::EndOfStream`].
    pub async fn recv_exact(&self, buf: &mut [u8], timeout: Timeout) -> Result<()> {
        let received = self.recv(buf, false, timeout).await?;
        if received == buf.len() {
            Ok(())
        } else if timeout.expired() {
            Err(Error::TimedOut)
        } else {
            Err(Error::EndOfStream {
                expected: buf.len(),
                received,
            })
        }
    }

    /// Writes all of `buf`, discarding the count.
    pub async fn send_exact(&self, buf: &[u8], timeout: Timeout) -> Result<()> {
        self.send(buf, timeout).await.map(|_| ())
    }

    /// Locally bound address of a TCP stream.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let handle = live(&self.handle)?;
        inet(with_socket(handle, "getsockname", |s| s.local_addr())?, "getsockname")
    }

    /// Address of the connected TCP peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let handle = live(&self.handle)?;
        inet(with_socket(handle, "getpeername", |s| s.peer_addr())?, "getpeername")
    }

    /// Toggles Nagle's algorithm (`TCP_NODELAY`).
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        let handle = live(&self.handle)?;
        with_socket(handle, "setsockopt(TCP_NODELAY)", |s| s.set_nodelay(nodelay))
    }

    /// Shuts down one or both directions without closing the descriptor.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let handle = live(&self.handle)?;
        with_socket(handle, "shutdown", |s| s.shutdown(how))
    }

    /// The underlying handle, while open.
    pub fn id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(Handle::id)
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Closes the stream. Does nothing if already closed.
    pub fn close(&mut self) {
        self.handle.take();
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.handle
            .as_ref()
            .and_then(|h| h.fd().ok())
            .unwrap_or(-1)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("handle", &self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Listener;
    use crate::reactor::ReactorConfig;
    use crate::sched::LocalScheduler;
    use rand::Rng;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::unix::net::UnixListener;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    fn reactor(config: ReactorConfig) -> (LocalScheduler, Reactor) {
        let sched = LocalScheduler::default();
        let reactor = Reactor::new(config, Rc::new(sched.clone())).unwrap();
        (sched, reactor)
    }

    fn secs(n: u64) -> Timeout {
        Timeout::after(Duration::from_secs(n))
    }

    #[test]
    fn test_echo_until_stop_byte() {
        let (sched, reactor) = reactor(ReactorConfig::default());
        let listener = Listener::listen(&reactor, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = Rc::new(Cell::new(false));
        let finished = Rc::new(Cell::new(false));

        let s = sched.clone();
        let (flag, done) = (stop.clone(), finished.clone());
        sched.spawn(async move {
            while !flag.get() {
                let conn = match listener.accept(Timeout::after(Duration::from_millis(10))).await {
                    Ok(conn) => conn,
                    Err(Error::TimedOut) => continue,
                    Err(err) => panic!("accept failed: {}", err),
                };
                let flag = flag.clone();
                s.spawn(async move {
                    let mut buf = [0u8; 64];
                    loop {
                        let n = match conn.recv(&mut buf, true, secs(5)).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        if n > 5 && buf[4] == b'%' {
                            flag.set(true);
                            break;
                        }
                        conn.send(&buf[..n], secs(5)).await.unwrap();
                    }
                });
            }
            drop(listener);
            done.set(true);
        });

        let r = reactor.clone();
        let done = finished.clone();
        let echoed = sched.block_on(async move {
            let client = Stream::connect_tcp(&r, addr, secs(5), true).await.unwrap();
            client.send(b"hello", secs(5)).await.unwrap();
            let mut reply = [0u8; 5];
            client.recv_exact(&mut reply, secs(5)).await.unwrap();

            client.send(b"stop%now", secs(5)).await.unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done.get() && Instant::now() < deadline {
                r.sleep(Duration::from_millis(5)).await;
            }
            reply
        });

        assert_eq!(&echoed, b"hello");
        assert!(stop.get());
        assert!(finished.get());
        assert!(std::net::TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_random_payload_survives_any_chunking() {
        let mut rng = rand::thread_rng();
        for _ in 0..4 {
            let config = ReactorConfig {
                io_chunk_size: rng.gen_range(1..4096),
                ..ReactorConfig::default()
            };
            let (sched, reactor) = reactor(config);
            let payload: Vec<u8> = (0..rng.gen_range(1..200_000)).map(|_| rng.gen()).collect();
            let (mut a, b) = Stream::pair(&reactor).unwrap();

            let outgoing = payload.clone();
            sched.spawn(async move {
                a.send(&outgoing, secs(10)).await.unwrap();
                a.close();
            });

            let len = payload.len();
            let received = sched.block_on(async move {
                let mut out = vec![0u8; len + 1];
                let n = b.recv(&mut out, false, secs(10)).await.unwrap();
                out.truncate(n);
                out
            });
            assert_eq!(received, payload);
        }
    }

    #[test]
    fn test_recv_timeout_leaves_stream_usable() {
        let (sched, reactor) = reactor(ReactorConfig::default());
        let (a, b) = Stream::pair(&reactor).unwrap();

        let start = Instant::now();
        let result = sched.block_on(async {
            let mut buf = [0u8; 8];
            b.recv(&mut buf, false, Timeout::after(Duration::from_millis(30))).await
        });
        assert!(matches!(result, Err(Error::TimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(30));

        let got = sched.block_on(async {
            a.send(b"late", secs(5)).await.unwrap();
            let mut buf = [0u8; 4];
            b.recv_exact(&mut buf, secs(5)).await.map(|_| buf)
        });
        assert_eq!(&got.unwrap(), b"late");
    }

    #[test]
    fn test_connect_unix() {
        let (sched, reactor) = reactor(ReactorConfig::default());
        let path = format!("/tmp/strand_test_stream_{}.sock", std::process::id());
        let _ = std::fs::remove_file(&path);
        let server = UnixListener::bind(&path).unwrap();

        let client = Stream::connect_unix(&reactor, &path).unwrap();
        let (mut peer, _) = server.accept().unwrap();
        peer.write_all(b"unix").unwrap();

        let got = sched.block_on(async {
            let mut buf = [0u8; 4];
            client.recv_exact(&mut buf, secs(5)).await.map(|_| buf)
        });
        assert_eq!(&got.unwrap(), b"unix");
        assert!(matches!(
            Stream::connect_unix(&reactor, "/tmp/strand_test_stream_missing.sock"),
            Err(Error::Sys {
                source: Errno::ENOENT,
                ..
            })
        ));
        drop(client);
        assert_eq!(reactor.live_handles(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_recv_returns_partial_count_at_deadline() {
        let (sched, reactor) = reactor(ReactorConfig::default());
        let (a, b) = Stream::pair(&reactor).unwrap();

        let got = sched.block_on(async {
            a.send(b"abc", secs(5)).await.unwrap();
            let mut buf = [0u8; 16];
            let n = b
                .recv(&mut buf, false, Timeout::after(Duration::from_millis(30)))
                .await;
            n.map(|n| buf[..n].to_vec())
        });
        assert_eq!(got.unwrap(), b"abc");
    }

    #[test]
    fn test_recv_exact_partial_then_deadline_times_out() {
        let (sched, reactor) = reactor(ReactorConfig::default());
        let (a, b) = Stream::pair(&reactor).unwrap();

        let result = sched.block_on(async {
            a.send(b"abc", secs(5)).await.unwrap();
            let mut buf = [0u8; 8];
            b.recv_exact(&mut buf, Timeout::after(Duration::from_millis(30)))
                .await
        });
        assert!(matches!(result, Err(Error::TimedOut)));
    }

    #[test]
    fn test_send_times_out_when_peer_stops_reading() {
        let (sched, reactor) = reactor(ReactorConfig::default());
        let (a, b) = Stream::pair(&reactor).unwrap();
        let payload = vec![0x5au8; 8 << 20];

        let start = Instant::now();
        let result = sched.block_on(async {
            a.send(&payload, Timeout::after(Duration::from_millis(30)))
                .await
        });
        assert!(matches!(result, Err(Error::TimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(30));

        // The bytes that made it are readable and the stream is still open.
        let got = sched.block_on(async {
            let mut buf = [0u8; 4];
            b.recv_exact(&mut buf, secs(5)).await.map(|_| buf)
        });
        assert_eq!(got.unwrap(), [0x5a; 4]);
        assert!(!a.is_closed());
    }

    #[test]
    fn test_short_read_is_end_of_stream() {
        let (sched, reactor) = reactor(ReactorConfig::default());
        let (mut a, b) = Stream::pair(&reactor).unwrap();

        let result = sched.block_on(async {
            a.send(b"abc", secs(5)).await.unwrap();
            a.close();
            let mut buf = [0u8; 8];
            b.recv_exact(&mut buf, secs(5)).await
        });
        assert!(matches!(
            result,
            Err(Error::EndOfStream {
                expected: 8,
                received: 3
            })
        ));
    }

    #[test]
    fn test_close_twice_releases_once() {
        let (_sched, reactor) = reactor(ReactorConfig::default());
        let (mut a, b) = Stream::pair(&reactor).unwrap();
        assert_eq!(reactor.live_handles(), 2);

        a.close();
        a.close();
        assert_eq!(reactor.live_handles(), 1);
        assert!(matches!(a.peer_addr(), Err(Error::Closed)));
        drop(a);
        assert_eq!(reactor.live_handles(), 1);
        drop(b);
        assert_eq!(reactor.live_handles(), 0);
    }

    #[test]
    fn test_connect_refused() {
        let (sched, reactor) = reactor(ReactorConfig::default());
        // Bind then drop to get a port nobody listens on.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let result = sched.block_on(Stream::connect_tcp(&reactor, addr, secs(5), false));
        assert!(matches!(
            result,
            Err(Error::Sys {
                source: Errno::ECONNREFUSED,
                ..
            })
        ));
        assert_eq!(reactor.live_handles(), 0);
    }
}
