//! Two-role thread coordination state.
//!
//! The executor thread and the network thread are real OS threads, but their
//! progress is serialized: at any instant at most one holds the running
//! role and the other is parked on its condition variable. This module holds
//! the bookkeeping; the handoff loops live in the facade, next to the two
//! condition variables.

use std::thread::{self, ThreadId};

/// Which role currently runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Running {
    None,
    Executor,
    Network,
}

/// Coordination state guarded by the interface mutex.
///
/// `executor_waiting` / `network_waiting` are the waiting-to-run bits: a
/// thread becomes runnable when its bit is set and the running role is free.
/// The executor has priority; the network side only claims the role when the
/// executor has no pending claim.
#[derive(Debug)]
pub(crate) struct Coordinator {
    pub running: Running,
    pub executor_waiting: bool,
    pub network_waiting: bool,
    /// Identity of the thread holding (or mid-sweep, reserving) the network
    /// role. Enforces the single-network-thread rule.
    pub network_thread: Option<ThreadId>,
}

impl Coordinator {
    pub(crate) fn new() -> Self {
        Self {
            running: Running::None,
            executor_waiting: false,
            network_waiting: false,
            network_thread: None,
        }
    }

    /// The executor may take the running role.
    pub(crate) fn executor_runnable(&self) -> bool {
        self.running == Running::None && self.executor_waiting
    }

    /// A fresh thread may claim the network role via `enter_network`.
    pub(crate) fn network_claimable(&self) -> bool {
        self.running == Running::None && !self.executor_waiting && self.network_thread.is_none()
    }

    /// The reserving network thread may resume after yielding mid-sweep.
    pub(crate) fn network_resumable(&self) -> bool {
        self.running == Running::None && !self.executor_waiting
    }

    /// Takes the network role for the calling thread.
    pub(crate) fn claim_network(&mut self) {
        self.running = Running::Network;
        self.network_waiting = false;
        self.network_thread = Some(thread::current().id());
    }

    /// Releases the network role entirely.
    pub(crate) fn release_network(&mut self) {
        self.running = Running::None;
        self.network_thread = None;
    }

    /// True if the calling thread holds the network role right now.
    pub(crate) fn holds_network(&self) -> bool {
        self.running == Running::Network && self.network_thread == Some(thread::current().id())
    }

    /// Driver-misuse check for methods that require the network role.
    pub(crate) fn assert_network_role(&self) {
        assert!(
            self.holds_network(),
            "this method requires the network role; call enter_network first"
        );
    }
}
