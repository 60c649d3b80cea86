//! Poll scheduling modes for the multiplexer
//!
//! The reactor never blocks on its own; it is driven by the fiber scheduler
//! in one of the modes below, chosen once at startup.

use std::fmt;
use std::time::Duration;

/// Default interval for [`PollMode::Periodic`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How the scheduler drives the multiplexer
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// A zero-timeout poll registered as a regular scheduler poller,
    /// run every `interval`
    Periodic {
        /// Time between two polls
        interval: Duration,
    },

    /// The poll is the scheduler's idle action: when no fiber is runnable
    /// the kernel wait replaces the scheduler's own sleep
    IdleFallback,
}

impl fmt::Debug for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Periodic { interval } => write!(f, "Periodic(every={:?})", interval),
            Self::IdleFallback => write!(f, "IdleFallback"),
        }
    }
}

impl Default for PollMode {
    fn default() -> Self {
        Self::IdleFallback
    }
}

impl PollMode {
    /// Picks a mode for a scheduler.
    ///
    /// Schedulers that would otherwise block on the OS when idle should let
    /// the kernel wait take over; the rest get a periodic poll.
    pub fn select(idle_hook_available: bool) -> Self {
        if idle_hook_available {
            Self::IdleFallback
        } else {
            Self::Periodic {
                interval: DEFAULT_POLL_INTERVAL,
            }
        }
    }

    /// Whether the poll replaces the scheduler's idle sleep
    pub fn is_idle_fallback(&self) -> bool {
        matches!(self, Self::IdleFallback)
    }

    /// Interval passed to the scheduler when registering the poller
    pub fn interval(&self) -> Duration {
        match self {
            Self::Periodic { interval } => *interval,
            Self::IdleFallback => Duration::ZERO,
        }
    }

    /// Returns a human-readable description of this mode
    pub fn description(&self) -> String {
        match self {
            Self::Periodic { interval } => {
                format!("Periodic zero-timeout poll every {:?}", interval)
            }
            Self::IdleFallback => "Kernel wait as scheduler idle action".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_poll_mode() {
        assert!(PollMode::select(true).is_idle_fallback());

        let mode = PollMode::select(false);
        assert!(matches!(mode, PollMode::Periodic { .. }));
        assert_eq!(mode.interval(), DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_poll_mode_properties() {
        let idle = PollMode::IdleFallback;
        assert_eq!(idle.interval(), Duration::ZERO);
        assert_eq!(format!("{:?}", idle), "IdleFallback");
        assert!(idle.description().contains("idle action"));

        let periodic = PollMode::Periodic {
            interval: Duration::from_millis(5),
        };
        assert!(!periodic.is_idle_fallback());
        assert_eq!(format!("{:?}", periodic), "Periodic(every=5ms)");
        assert!(periodic.description().contains("5ms"));
    }
}
