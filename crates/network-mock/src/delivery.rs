//! Time-ordered queue of pending response deliveries.

use crate::registry::OperationRef;
use std::collections::BTreeMap;
use std::time::Duration;
use tasknet_network::CommandResult;

/// Key for ordering pending deliveries.
///
/// Deliveries are ordered by:
/// 1. Target virtual time (earlier first)
/// 2. Sequence number (FIFO for the same time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DeliveryKey {
    when: Duration,
    sequence: u64,
}

/// A reply (or synthetic error) waiting to be delivered.
pub(crate) struct PendingDelivery {
    pub op: OperationRef,
    pub result: CommandResult,
}

/// Queue of pending deliveries, drained front to back by the network
/// thread's processing sweep.
#[derive(Default)]
pub(crate) struct ResponseQueue {
    entries: BTreeMap<DeliveryKey, PendingDelivery>,
    next_sequence: u64,
}

impl ResponseQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueues a delivery for `op` at virtual time `when`.
    pub(crate) fn push(&mut self, when: Duration, op: OperationRef, result: CommandResult) {
        let key = DeliveryKey {
            when,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.entries.insert(key, PendingDelivery { op, result });
    }

    /// Target time of the earliest pending delivery.
    pub(crate) fn front_when(&self) -> Option<Duration> {
        self.entries.keys().next().map(|k| k.when)
    }

    /// Pops the earliest delivery if it is due at `now`.
    pub(crate) fn pop_ready(&mut self, now: Duration) -> Option<PendingDelivery> {
        let key = *self.entries.keys().next()?;
        if key.when > now {
            return None;
        }
        self.entries.remove(&key)
    }

    /// Pops the earliest delivery regardless of its target time. Used by
    /// shutdown to drain everything.
    pub(crate) fn pop_front_any(&mut self) -> Option<PendingDelivery> {
        let key = *self.entries.keys().next()?;
        self.entries.remove(&key)
    }

    /// True if a delivery is pending for `op`.
    pub(crate) fn contains_op(&self, op: OperationRef) -> bool {
        self.entries.values().any(|d| d.op == op)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasknet_network::CommandError;
    use tasknet_types::CommandResponse;

    fn opref(i: usize) -> OperationRef {
        // Build refs through a throwaway registry to keep the type opaque.
        use crate::registry::{Operation, OperationRegistry, ResponseAction};
        use serde_json::json;
        use tasknet_types::{CallbackId, CommandRequest, HostAndPort};
        let mut reg = OperationRegistry::new();
        let mut last = None;
        for n in 0..=i {
            last = Some(reg.append(Operation::new(
                CallbackId::new(n as u64),
                CommandRequest::new(HostAndPort::new("a", 1), "db", json!({})),
                Duration::ZERO,
                ResponseAction::Once(Some(Box::new(|_| {}))),
            )));
        }
        last.unwrap()
    }

    #[test]
    fn orders_by_time_then_insertion() {
        let mut queue = ResponseQueue::new();
        let (a, b, c) = (opref(0), opref(1), opref(2));
        queue.push(Duration::from_millis(20), b, Ok(CommandResponse::default()));
        queue.push(Duration::from_millis(10), a, Ok(CommandResponse::default()));
        queue.push(Duration::from_millis(10), c, Ok(CommandResponse::default()));

        let now = Duration::from_millis(100);
        assert_eq!(queue.pop_ready(now).unwrap().op, a);
        assert_eq!(queue.pop_ready(now).unwrap().op, c);
        assert_eq!(queue.pop_ready(now).unwrap().op, b);
        assert!(queue.pop_ready(now).is_none());
    }

    #[test]
    fn pop_ready_respects_now() {
        let mut queue = ResponseQueue::new();
        let a = opref(0);
        queue.push(Duration::from_millis(50), a, Err(CommandError::NetworkTimeout));
        assert!(queue.pop_ready(Duration::from_millis(49)).is_none());
        // An entry at exactly `now` is ready.
        assert!(queue.pop_ready(Duration::from_millis(50)).is_some());
    }

    #[test]
    fn contains_op_tracks_pending_entries() {
        let mut queue = ResponseQueue::new();
        let a = opref(0);
        assert!(!queue.contains_op(a));
        queue.push(Duration::ZERO, a, Ok(CommandResponse::default()));
        assert!(queue.contains_op(a));
        queue.pop_front_any();
        assert!(!queue.contains_op(a));
    }
}
