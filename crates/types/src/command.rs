//! Remote command request and response types.

use crate::HostAndPort;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque identity for a submitted command or alarm.
///
/// The executor mints these; the network interface only compares and hashes
/// them. The same id is shared by an operation and any bookkeeping attached
/// to it (its timeout, a handshake issued on its behalf).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Creates an id from a raw integer.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// An outbound remote command.
///
/// `targets` lists the candidate hosts; the first entry is the connection
/// target. Virtual-time budgets are expressed as [`Duration`]s since
/// interface start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Candidate target hosts, first entry preferred.
    pub targets: Vec<HostAndPort>,
    /// Database the command addresses.
    pub db_name: String,
    /// The command document.
    pub body: serde_json::Value,
    /// Per-attempt timeout, measured from submission.
    pub timeout: Option<Duration>,
    /// Absolute virtual-time deadline for the overall operation, if any.
    pub deadline: Option<Duration>,
}

impl CommandRequest {
    /// Creates a request addressed to a single host.
    pub fn new(target: HostAndPort, db_name: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            targets: vec![target],
            db_name: db_name.into(),
            body,
            timeout: None,
            deadline: None,
        }
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The connection target: the first listed host.
    pub fn target(&self) -> Option<&HostAndPort> {
        self.targets.first()
    }
}

/// A remote command reply.
///
/// `elapsed` is filled in by the network interface when the reply is
/// scheduled. `more_to_come` marks a non-terminal reply in an exhaust
/// stream; the final reply of a stream clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// The reply document.
    pub body: serde_json::Value,
    /// Virtual time between submission and reply.
    pub elapsed: Option<Duration>,
    /// True for a non-terminal exhaust reply.
    pub more_to_come: bool,
}

impl CommandResponse {
    /// Creates a terminal reply carrying `body`.
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            body,
            elapsed: None,
            more_to_come: false,
        }
    }

    /// Marks this reply as a non-terminal exhaust reply.
    #[must_use]
    pub fn with_more_to_come(mut self) -> Self {
        self.more_to_come = true;
        self
    }
}

impl Default for CommandResponse {
    /// The empty success reply, used as the default handshake reply for
    /// hosts without a canned one.
    fn default() -> Self {
        Self::new(serde_json::json!({}))
    }
}
