use super::poll_mode::PollMode;

/// Configuration for the reactor.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Maximum number of live handles (open descriptors) at any time.
    pub max_handles: usize,

    /// Maximum number of kernel events collected by one poll.
    pub poll_batch: usize,

    /// How the scheduler drives the multiplexer.
    pub poll_mode: PollMode,

    /// Upper bound on the bytes moved by a single read or write call.
    pub io_chunk_size: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_handles: 1024,
            poll_batch: 128,
            poll_mode: PollMode::IdleFallback,
            io_chunk_size: 64 * 1024, // 64 KiB
        }
    }
}
