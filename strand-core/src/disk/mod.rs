//! Disk transport.
//!
//! Regular files are always reported ready by the multiplexer, so the
//! operations here never park the calling fiber. They are thin wrappers
//! over the system calls with error translation.

mod file;

pub use file::{File, FileStat};
