//! Connection and metadata hooks.
//!
//! Hooks are installed once before startup and are read-only afterwards.
//! Implementations must invoke them with no interface lock held.

use crate::CommandError;
use tasknet_types::{CommandRequest, CommandResponse, HostAndPort};

/// Validates the simulated handshake on first contact with a host.
///
/// When a hook is installed, the interface runs this exchange before the
/// first command to each host:
///
/// 1. [`validate_host`](Self::validate_host) is called with the canned
///    handshake reply configured for the host (or the default empty
///    success). Failure fails the pending command with the returned error.
/// 2. On success, [`post_connect_request`](Self::post_connect_request) may
///    emit a follow-up request. It is issued ahead of the pending command
///    and must complete successfully — via
///    [`handle_post_connect_reply`](Self::handle_post_connect_reply) —
///    before the pending command is released.
pub trait ConnectionHook: Send + Sync {
    /// Validates a host's handshake reply.
    fn validate_host(
        &self,
        host: &HostAndPort,
        handshake_reply: &CommandResponse,
    ) -> Result<(), CommandError>;

    /// Optionally emits a follow-up request to run after validation.
    fn post_connect_request(
        &self,
        host: &HostAndPort,
    ) -> Result<Option<CommandRequest>, CommandError>;

    /// Inspects the reply to the follow-up request.
    fn handle_post_connect_reply(
        &self,
        host: &HostAndPort,
        reply: &CommandResponse,
    ) -> Result<(), CommandError>;
}

/// Decorates outgoing requests and inspects incoming replies.
pub trait MetadataHook: Send + Sync {
    /// Decorates an outgoing request before it is registered.
    fn write_request_metadata(&self, request: &mut CommandRequest) -> Result<(), CommandError>;

    /// Inspects an incoming reply before it reaches the completion
    /// callback. An error here replaces the reply.
    fn read_reply_metadata(&self, reply: &CommandResponse) -> Result<(), CommandError>;
}
