//! The network interface trait.
//!
//! Defines the executor-facing API implemented by network backends. The mock
//! backend (`tasknet-network-mock`) implements it under fully virtual time.

use crate::CommandError;
use std::time::Duration;
use tasknet_types::{CallbackId, CommandRequest, CommandResponse};

/// Outcome delivered to a command's completion callback.
pub type CommandResult = Result<CommandResponse, CommandError>;

/// Completion callback for a plain command. Invoked exactly once.
pub type CommandCallback = Box<dyn FnOnce(CommandResult) + Send>;

/// Reply callback for an exhaust command. Invoked once per reply; the
/// terminal reply (an error, or a response without `more_to_come`) is the
/// last invocation.
pub type ExhaustCallback = Box<dyn FnMut(CommandResult) + Send>;

/// Action run when an alarm fires (`Ok(())`) or is torn down at shutdown
/// (`Err(CallbackCanceled)`).
pub type AlarmAction = Box<dyn FnOnce(Result<(), CommandError>) + Send>;

/// Network interface for submitting remote commands and scheduling alarms.
///
/// All callbacks run on the network side with no interface lock held;
/// re-entry from a callback back into the interface is permitted.
///
/// Two cooperating threads use this surface: the executor thread submits
/// work and parks in [`wait_for_work`](Self::wait_for_work), and the network
/// side delivers completions. Implementations serialize the two so their
/// interleaving is well defined.
pub trait NetworkInterface: Send + Sync {
    /// Starts the interface. Idempotent.
    fn startup(&self);

    /// Shuts the interface down: pending operations complete with
    /// [`CommandError::ShutdownInProgress`], pending alarms fire with
    /// [`CommandError::CallbackCanceled`], and subsequent submissions fail.
    /// Idempotent.
    fn shutdown(&self);

    /// True once [`shutdown`](Self::shutdown) has begun.
    fn in_shutdown(&self) -> bool;

    /// Current virtual time.
    fn now(&self) -> Duration;

    /// Name of the local host.
    fn host_name(&self) -> String;

    /// Submits a remote command. `on_finish` is invoked exactly once with
    /// the outcome.
    fn start_command(
        &self,
        id: CallbackId,
        request: CommandRequest,
        on_finish: CommandCallback,
    ) -> Result<(), CommandError>;

    /// Submits an exhaust command: `on_reply` may be invoked multiple times,
    /// once per reply, until a terminal reply arrives.
    fn start_exhaust_command(
        &self,
        id: CallbackId,
        request: CommandRequest,
        on_reply: ExhaustCallback,
    ) -> Result<(), CommandError>;

    /// Requests cancellation of a pending command. If the command already
    /// has a delivery scheduled, that delivery wins; if it is finished or
    /// unknown, this is a no-op.
    fn cancel_command(&self, id: CallbackId);

    /// Schedules `action` to run at virtual time `when`. If `when` has
    /// already passed, the action runs synchronously on the calling thread
    /// with `Ok(())` before this method returns.
    fn set_alarm(
        &self,
        id: CallbackId,
        when: Duration,
        action: AlarmAction,
    ) -> Result<(), CommandError>;

    /// Cancels a pending alarm. Unknown or already-fired ids are a no-op.
    fn cancel_alarm(&self, id: CallbackId);

    /// Schedules `action` to run on the network side during its next
    /// processing sweep with `Ok(())`, or with
    /// [`CommandError::CallbackCanceled`] at shutdown.
    fn schedule(&self, action: AlarmAction) -> Result<(), CommandError>;

    /// Marks the executor as having work, waking it if it is parked.
    fn signal_work_available(&self);

    /// Parks the executor thread until work is signaled. Must be called from
    /// the executor thread.
    fn wait_for_work(&self);

    /// Parks the executor thread until work is signaled or virtual time
    /// reaches `deadline`. Must be called from the executor thread.
    fn wait_for_work_until(&self, deadline: Duration);

    /// True if the calling thread currently holds the network role.
    fn on_network_thread(&self) -> bool;
}
