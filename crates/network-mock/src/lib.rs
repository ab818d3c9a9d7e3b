//! Deterministic mock network interface.
//!
//! This crate provides [`MockNetwork`], an implementation of
//! `tasknet_network::NetworkInterface` with a fully virtualized notion of
//! time and the network, for unit-testing components that issue remote
//! commands through a task executor.
//!
//! When the component under test submits a command, the interface records it
//! for immediate consideration by the test driver. The driver — acting as
//! the remote side from a second thread — observes pending requests,
//! schedules replies at chosen virtual times, swallows requests it wants to
//! leave hanging, and runs virtual time forward until replies and alarms
//! come due.
//!
//! The executor thread and the test-driver ("network") thread are tightly
//! serialized: at most one runs at a time, and the processing sweep only
//! returns once the executor is parked. Given the same driver script, every
//! run interleaves identically.
//!
//! # Example
//!
//! ```ignore
//! let net = MockNetwork::new();
//! net.startup();
//! // ... spawn the executor thread, submit a command ...
//! let guard = net.enter_network_guard();
//! let req = guard.schedule_successful_response(serde_json::json!({"ok": 1}));
//! assert_eq!(req.db_name, "admin");
//! guard.run_until(Duration::from_millis(10));
//! ```

mod alarms;
mod clock;
mod coordinator;
mod delivery;
mod guard;
mod mock;
mod registry;

pub use guard::InNetworkGuard;
pub use mock::MockNetwork;
pub use registry::OperationRef;
