//! Scheduled alarms with lazy cancellation.
//!
//! Alarms live in a min-heap keyed by firing time, ties broken by insertion
//! order. Cancellation is logical: removing an arbitrary heap entry would be
//! costly, so canceled ids go into a tombstone set and are discarded when
//! they reach the top.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;
use tasknet_network::AlarmAction;
use tasknet_types::CallbackId;

/// What to do when an alarm fires.
pub(crate) enum AlarmKind {
    /// A user action from `set_alarm` or `schedule`.
    Action(AlarmAction),
    /// Internal marker: the per-attempt timeout of a command elapsed.
    CommandTimeout(CallbackId),
}

/// A scheduled alarm.
pub(crate) struct Alarm {
    pub when: Duration,
    sequence: u64,
    /// Cancellation id. `None` for anonymous entries (from `schedule`),
    /// which cannot be canceled individually.
    pub id: Option<CallbackId>,
    pub kind: AlarmKind,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.sequence == other.sequence
    }
}

impl Eq for Alarm {}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap ordering: earliest firing time first, then insertion order.
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of scheduled alarms plus the canceled-id tombstone set.
#[derive(Default)]
pub(crate) struct AlarmHeap {
    heap: BinaryHeap<Alarm>,
    canceled: HashSet<CallbackId>,
    next_sequence: u64,
}

impl AlarmHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules an alarm at `when`.
    pub(crate) fn push(&mut self, when: Duration, id: Option<CallbackId>, kind: AlarmKind) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Alarm {
            when,
            sequence,
            id,
            kind,
        });
    }

    /// Cancels the pending alarm registered under `id`, if one exists.
    /// Unknown or already-fired ids are a no-op.
    pub(crate) fn cancel(&mut self, id: CallbackId) {
        let live = self
            .heap
            .iter()
            .any(|a| a.id == Some(id) && !self.canceled.contains(&id));
        if live {
            self.canceled.insert(id);
        }
    }

    /// Firing time of the earliest non-canceled alarm.
    pub(crate) fn next_when(&self) -> Option<Duration> {
        self.heap
            .iter()
            .filter(|a| !self.is_canceled(a))
            .map(|a| a.when)
            .min()
    }

    /// Pops the earliest alarm due at `now`, discarding canceled entries on
    /// the way. Each tombstone suppresses one firing.
    pub(crate) fn pop_ready(&mut self, now: Duration) -> Option<Alarm> {
        while let Some(top) = self.heap.peek() {
            if top.when > now {
                return None;
            }
            let alarm = self.heap.pop()?;
            if let Some(id) = alarm.id {
                if self.canceled.remove(&id) {
                    continue;
                }
            }
            return Some(alarm);
        }
        None
    }

    /// Removes and returns all non-canceled alarms in firing order. Used by
    /// shutdown to tear everything down.
    pub(crate) fn drain(&mut self) -> Vec<Alarm> {
        let mut out = Vec::new();
        while let Some(alarm) = self.heap.pop() {
            if let Some(id) = alarm.id {
                if self.canceled.remove(&id) {
                    continue;
                }
            }
            out.push(alarm);
        }
        out
    }

    /// Number of pending non-canceled alarms.
    pub(crate) fn live_len(&self) -> usize {
        self.heap.iter().filter(|a| !self.is_canceled(a)).count()
    }

    fn is_canceled(&self, alarm: &Alarm) -> bool {
        alarm.id.is_some_and(|id| self.canceled.contains(&id))
    }
}
