//! Append-only log of submitted operations.
//!
//! Every command ever submitted gets an entry here; entries are never
//! removed, so an [`OperationRef`] stays valid for the lifetime of the
//! interface. Records are retained after they finish (immutable from then
//! on) for diagnostics.

use std::time::Duration;
use tasknet_network::{CommandCallback, CommandResult, ExhaustCallback};
use tasknet_types::{CallbackId, CommandRequest};

/// Lifecycle state of a registered operation.
///
/// Transitions are monotonic: `Unscheduled -> Processing -> Finished`, with
/// the side branch `Processing -> Blackholed` for operations the test driver
/// refuses to answer. A blackholed operation stays pending until shutdown
/// completes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpState {
    /// Submitted, not yet observed by the network thread.
    Unscheduled,
    /// Observed by the network thread; a reply may be scheduled.
    Processing,
    /// Swallowed by the test driver; only shutdown answers it.
    Blackholed,
    /// Completion delivered.
    Finished,
}

/// Completion callback storage for an operation.
///
/// A plain command completes exactly once; an exhaust command's callback is
/// invoked once per reply until a terminal one arrives.
pub(crate) enum ResponseAction {
    Once(Option<CommandCallback>),
    Stream(ExhaustCallback),
}

impl ResponseAction {
    /// Invokes the callback with `result`. For `Once` the callback is
    /// consumed; later invocations are ignored.
    pub(crate) fn invoke(&mut self, result: CommandResult) {
        match self {
            ResponseAction::Once(cb) => {
                if let Some(cb) = cb.take() {
                    cb(result);
                }
            }
            ResponseAction::Stream(cb) => cb(result),
        }
    }

    /// True for a plain (single-completion) command.
    pub(crate) fn is_once(&self) -> bool {
        matches!(self, ResponseAction::Once(_))
    }
}

/// One in-flight (or retained) remote command.
pub(crate) struct Operation {
    id: CallbackId,
    request: CommandRequest,
    request_date: Duration,
    state: OpState,
    on_response: Option<ResponseAction>,
}

impl Operation {
    pub(crate) fn new(
        id: CallbackId,
        request: CommandRequest,
        request_date: Duration,
        on_response: ResponseAction,
    ) -> Self {
        Self {
            id,
            request,
            request_date,
            state: OpState::Unscheduled,
            on_response: Some(on_response),
        }
    }

    pub(crate) fn id(&self) -> CallbackId {
        self.id
    }

    pub(crate) fn request(&self) -> &CommandRequest {
        &self.request
    }

    pub(crate) fn request_date(&self) -> Duration {
        self.request_date
    }

    pub(crate) fn state(&self) -> OpState {
        self.state
    }

    /// True if the network thread has not yet observed this operation.
    pub(crate) fn is_ready(&self) -> bool {
        self.state == OpState::Unscheduled
    }

    /// Marks the operation as observed by the network thread.
    pub(crate) fn mark_processing(&mut self) {
        if self.state == OpState::Unscheduled {
            self.state = OpState::Processing;
        }
    }

    /// Marks the operation as swallowed by the test driver.
    pub(crate) fn mark_blackholed(&mut self) {
        assert!(
            self.state != OpState::Finished,
            "black_hole on a finished operation"
        );
        self.state = OpState::Blackholed;
    }

    pub(crate) fn mark_finished(&mut self) {
        self.state = OpState::Finished;
    }

    /// Takes the completion callback out for invocation with the lock
    /// released. Non-terminal exhaust deliveries put it back afterwards.
    pub(crate) fn take_response_action(&mut self) -> Option<ResponseAction> {
        self.on_response.take()
    }

    pub(crate) fn put_back_response_action(&mut self, action: ResponseAction) {
        self.on_response = Some(action);
    }

    /// Consumes an unregistered operation, yielding its callback. Used when
    /// a handshake fails and the operation completes without ever entering
    /// the registry.
    pub(crate) fn into_response_action(mut self) -> ResponseAction {
        self.on_response.take().unwrap_or(ResponseAction::Once(None))
    }
}

/// Stable, opaque reference to a registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationRef(usize);

/// Per-state operation counts, for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateCounts {
    pub unscheduled: usize,
    pub processing: usize,
    pub blackholed: usize,
    pub finished: usize,
}

/// The append-only operation log.
#[derive(Default)]
pub(crate) struct OperationRegistry {
    ops: Vec<Operation>,
}

impl OperationRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends `op`, returning its stable reference.
    pub(crate) fn append(&mut self, op: Operation) -> OperationRef {
        self.ops.push(op);
        OperationRef(self.ops.len() - 1)
    }

    /// Panics on an unknown reference; that is driver misuse.
    pub(crate) fn get(&self, opref: OperationRef) -> &Operation {
        &self.ops[opref.0]
    }

    pub(crate) fn get_mut(&mut self, opref: OperationRef) -> &mut Operation {
        &mut self.ops[opref.0]
    }

    pub(crate) fn refs(&self) -> impl Iterator<Item = OperationRef> + '_ {
        (0..self.ops.len()).map(OperationRef)
    }

    /// Oldest operation not yet observed by the network thread.
    pub(crate) fn first_unscheduled(&self) -> Option<OperationRef> {
        self.nth_unscheduled(0)
    }

    /// The n-th (0-based, oldest first) unscheduled operation.
    pub(crate) fn nth_unscheduled(&self, n: usize) -> Option<OperationRef> {
        self.ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.is_ready())
            .nth(n)
            .map(|(i, _)| OperationRef(i))
    }

    /// First non-finished operation submitted under `id`, oldest first.
    /// Handshake chains register under the user's id, so this reaches the
    /// gating operation first.
    pub(crate) fn find_active(&self, id: CallbackId) -> Option<OperationRef> {
        self.ops
            .iter()
            .position(|op| op.id() == id && op.state() != OpState::Finished)
            .map(OperationRef)
    }

    pub(crate) fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for op in &self.ops {
            match op.state() {
                OpState::Unscheduled => counts.unscheduled += 1,
                OpState::Processing => counts.processing += 1,
                OpState::Blackholed => counts.blackholed += 1,
                OpState::Finished => counts.finished += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tasknet_types::HostAndPort;

    fn op(id: u64) -> Operation {
        Operation::new(
            CallbackId::new(id),
            CommandRequest::new(HostAndPort::new("a", 1), "db", json!({})),
            Duration::ZERO,
            ResponseAction::Once(Some(Box::new(|_| {}))),
        )
    }

    #[test]
    fn refs_stay_valid_across_appends() {
        let mut reg = OperationRegistry::new();
        let first = reg.append(op(1));
        for i in 2..100 {
            reg.append(op(i));
        }
        assert_eq!(reg.get(first).id(), CallbackId::new(1));
    }

    #[test]
    fn unscheduled_ordering_is_submission_order() {
        let mut reg = OperationRegistry::new();
        let a = reg.append(op(1));
        let b = reg.append(op(2));
        assert_eq!(reg.first_unscheduled(), Some(a));
        reg.get_mut(a).mark_processing();
        assert_eq!(reg.first_unscheduled(), Some(b));
        assert_eq!(reg.nth_unscheduled(1), None);
    }

    #[test]
    fn find_active_skips_finished() {
        let mut reg = OperationRegistry::new();
        let a = reg.append(op(7));
        let b = reg.append(op(7));
        reg.get_mut(a).mark_finished();
        assert_eq!(reg.find_active(CallbackId::new(7)), Some(b));
        reg.get_mut(b).mark_finished();
        assert_eq!(reg.find_active(CallbackId::new(7)), None);
    }

    #[test]
    fn state_transitions_are_monotonic() {
        let mut reg = OperationRegistry::new();
        let a = reg.append(op(1));
        assert_eq!(reg.get(a).state(), OpState::Unscheduled);
        reg.get_mut(a).mark_processing();
        // A second observation does not regress the state.
        reg.get_mut(a).mark_processing();
        assert_eq!(reg.get(a).state(), OpState::Processing);
        reg.get_mut(a).mark_blackholed();
        assert_eq!(reg.get(a).state(), OpState::Blackholed);
        reg.get_mut(a).mark_finished();
        assert_eq!(reg.get(a).state(), OpState::Finished);
    }

    #[test]
    fn counts_by_state() {
        let mut reg = OperationRegistry::new();
        let a = reg.append(op(1));
        reg.append(op(2));
        reg.get_mut(a).mark_processing();
        let counts = reg.state_counts();
        assert_eq!(counts.unscheduled, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.finished, 0);
    }
}
