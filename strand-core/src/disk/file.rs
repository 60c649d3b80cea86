use crate::error::{Error, Result};
use crate::reactor::{Handle, HandleId, Reactor};
use nix::errno::Errno;
use nix::unistd::{fsync, ftruncate, lseek, Whence};
use std::fmt;
use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Metadata returned by [`File::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes.
    pub len: u64,
    /// Type and permission bits (`st_mode`).
    pub mode: u32,
    pub inode: u64,
    /// 512-byte blocks allocated.
    pub blocks: u64,
    pub modified: SystemTime,
}

impl FileStat {
    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Permission bits only.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

impl From<libc::stat> for FileStat {
    fn from(st: libc::stat) -> Self {
        let modified = if st.st_mtime >= 0 {
            UNIX_EPOCH + Duration::new(st.st_mtime as u64, st.st_mtime_nsec as u32)
        } else {
            UNIX_EPOCH - Duration::from_secs(st.st_mtime.unsigned_abs())
        };
        Self {
            len: st.st_size as u64,
            mode: st.st_mode,
            inode: st.st_ino,
            blocks: st.st_blocks as u64,
            modified,
        }
    }
}

/// A regular file registered with the reactor.
pub struct File {
    handle: Option<Handle>,
}

impl File {
    /// Opens `path` with `options`.
    ///
    /// Only regular files are accepted: directories fail with `EISDIR`,
    /// pipes, sockets and devices with `EINVAL`.
    pub fn open(reactor: &Reactor, path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = options.open(path).map_err(|e| Error::io("open", e))?;
        let meta = file.metadata().map_err(|e| Error::io("fstat", e))?;
        if !meta.is_file() {
            let errno = if meta.is_dir() {
                Errno::EISDIR
            } else {
                Errno::EINVAL
            };
            return Err(Error::sys("open", errno));
        }
        let handle = Handle::register(reactor, file.into_raw_fd())?;
        trace!("Opened {} as {:?}", path.display(), handle.id());
        Ok(Self {
            handle: Some(handle),
        })
    }

    fn fd(&self) -> Result<RawFd> {
        match &self.handle {
            Some(handle) => handle.fd(),
            None => Err(Error::Closed),
        }
    }

    /// Reads at the current offset. Returns 0 at end of file.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.fd()?;
        loop {
            match nix::unistd::read(fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(Error::sys("read", err)),
            }
        }
    }

    /// Fills `buf` or fails with [`Error::EndOfStream`].
    pub fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut got = 0;
        while got < buf.len() {
            match self.read(&mut buf[got..])? {
                0 => {
                    return Err(Error::EndOfStream {
                        expected: buf.len(),
                        received: got,
                    })
                }
                n => got += n,
            }
        }
        Ok(())
    }

    /// Writes all of `buf`, looping over short writes.
    ///
    /// # Panics
    ///
    /// If the kernel reports a zero-length write without an error.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let fd = self.fd()?;
        let mut written = 0;
        while written < buf.len() {
            match nix::unistd::write(fd, &buf[written..]) {
                Ok(0) => panic!("write to fd {} made no progress", fd),
                Ok(n) => written += n,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(Error::sys("write", err)),
            }
        }
        Ok(written)
    }

    /// Moves the file offset, returning the new position.
    pub fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let fd = self.fd()?;
        let (offset, whence) = match pos {
            SeekFrom::Start(n) => (n as libc::off_t, Whence::SeekSet),
            SeekFrom::Current(n) => (n as libc::off_t, Whence::SeekCur),
            SeekFrom::End(n) => (n as libc::off_t, Whence::SeekEnd),
        };
        let at = lseek(fd, offset, whence).map_err(|e| Error::sys("lseek", e))?;
        Ok(at as u64)
    }

    /// The current file offset.
    pub fn tell(&self) -> Result<u64> {
        self.seek(SeekFrom::Current(0))
    }

    /// Sets the file length to `len`, extending with zeros if needed.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let fd = self.fd()?;
        ftruncate(fd, len as libc::off_t).map_err(|e| Error::sys("ftruncate", e))
    }

    /// Metadata of the open file.
    pub fn stat(&self) -> Result<FileStat> {
        let fd = self.fd()?;
        let st = nix::sys::stat::fstat(fd).map_err(|e| Error::sys("fstat", e))?;
        Ok(FileStat::from(st))
    }

    /// Flushes data and metadata to the device.
    pub fn sync(&self) -> Result<()> {
        let fd = self.fd()?;
        fsync(fd).map_err(|e| Error::sys("fsync", e))
    }

    /// The underlying handle, while open.
    pub fn id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(Handle::id)
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Closes the file. Does nothing if already closed.
    pub fn close(&mut self) {
        self.handle.take();
    }
}

impl AsRawFd for File {
    fn as_raw_fd(&self) -> RawFd {
        self.fd().unwrap_or(-1)
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File").field("handle", &self.handle).finish()
    }
}
