//! Error taxonomy for command submission and delivery.

/// Error delivered to a command's completion callback or returned from
/// submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The interface is shutting down; no new work is accepted and pending
    /// work is completed with this error.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// The operation or alarm was canceled before it completed.
    #[error("callback canceled")]
    CallbackCanceled,

    /// The operation's per-attempt timeout elapsed in virtual time.
    #[error("network timeout")]
    NetworkTimeout,

    /// The target host could not be reached.
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    /// The connection handshake was rejected by the validator.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}
