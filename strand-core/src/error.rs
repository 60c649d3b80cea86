//! Error types shared by the reactor, watchers and transports.
//!
//! Would-block and interrupted system calls are never surfaced: they are
//! consumed by the retry loops. Programmer errors (double registration,
//! touching a closed handle, releasing a live one) are panics, not variants.

use nix::errno::Errno;
use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by reactor operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A system call failed with something other than would-block or EINTR.
    #[error("{op} failed: {source}")]
    Sys {
        op: &'static str,
        #[source]
        source: Errno,
    },

    /// A socket or file call made through `std`/`socket2` failed.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The peer closed the stream before the expected amount arrived.
    #[error("end of stream after {received} of {expected} bytes")]
    EndOfStream { expected: usize, received: usize },

    /// The deadline passed before the descriptor became ready.
    #[error("operation timed out")]
    TimedOut,

    /// Every slot of the handle arena is in use.
    #[error("handle arena exhausted ({capacity} slots)")]
    ResourceExhausted { capacity: usize },

    /// The transport was already closed.
    #[error("transport is closed")]
    Closed,

    /// The datagram is larger than a single message can carry.
    #[error("datagram of {len} bytes exceeds the {max} byte limit")]
    DatagramTooLarge { len: usize, max: usize },

    /// A received datagram did not fit and its tail was discarded.
    #[error("datagram of {len} bytes truncated to {capacity}")]
    DatagramTruncated { len: usize, capacity: usize },
}

impl Error {
    pub(crate) fn sys(op: &'static str, source: Errno) -> Self {
        Self::Sys { op, source }
    }

    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        // Errno-backed failures always land on `Sys`.
        match source.raw_os_error() {
            Some(code) => Self::Sys {
                op,
                source: Errno::from_i32(code),
            },
            None => Self::Io { op, source },
        }
    }

    /// Returns true for [`Error::TimedOut`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Returns true when the peer went away (short read or reset connection).
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream { .. })
    }

    /// Returns the underlying errno, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Sys { source, .. } => Some(*source),
            Self::Io { source, .. } => source.raw_os_error().map(Errno::from_i32),
            _ => None,
        }
    }
}
