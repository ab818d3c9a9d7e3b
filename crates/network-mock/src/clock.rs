//! Virtual clock.

use std::time::Duration;

/// Monotonically non-decreasing virtual time.
///
/// Starts at zero. Mutated only while the caller holds the network role and
/// the interface lock, so every observer agrees on the current instant.
#[derive(Debug, Default)]
pub(crate) struct VirtualClock {
    now: Duration,
}

impl VirtualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: Duration::ZERO,
        }
    }

    /// Current virtual time.
    pub(crate) fn now(&self) -> Duration {
        self.now
    }

    /// Advances to `to`. Never moves backwards.
    pub(crate) fn advance_to(&mut self, to: Duration) {
        assert!(
            to >= self.now,
            "virtual clock may not move backwards: {:?} -> {:?}",
            self.now,
            to
        );
        self.now = to;
    }
}
