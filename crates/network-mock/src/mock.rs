//! The mock network interface facade.
//!
//! # Architecture
//!
//! ```text
//! executor thread                     network thread (test driver)
//! ───────────────                     ────────────────────────────
//! start_command ──┐                   enter_network
//! cancel_command  │    ┌──────────┐   get_next_ready_request ──┐
//! set_alarm ──────┼──▶ │  State   │ ◀─ schedule_response        │
//! wait_for_work ◀─┘    │ (mutex)  │    run_until / advance_time │
//!       ▲              └──────────┘    run_ready_network_ops ◀──┘
//!       │                   │
//!       └── completions ◀───┘  (delivered on the network thread)
//! ```
//!
//! One mutex guards the clock, registry, queues, connection table, and the
//! thread coordinator. The two condition variables next to it implement the
//! executor/network handoff: at most one side runs at a time, and the
//! processing sweep only returns once the executor is parked again.
//!
//! Hooks are installed once before startup and invoked with the lock
//! released, as are all completion callbacks and alarm actions; re-entry
//! from a callback back into the facade is permitted.

use crate::alarms::{Alarm, AlarmHeap, AlarmKind};
use crate::clock::VirtualClock;
use crate::coordinator::{Coordinator, Running};
use crate::delivery::{PendingDelivery, ResponseQueue};
use crate::guard::InNetworkGuard;
use crate::registry::{OpState, Operation, OperationRef, OperationRegistry, ResponseAction};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::Duration;
use tasknet_network::{
    AlarmAction, CommandCallback, CommandError, CommandResult, ConnectionHook, ExhaustCallback,
    MetadataHook, NetworkInterface,
};
use tasknet_types::{CallbackId, CommandRequest, CommandResponse, HostAndPort};
use tracing::{debug, trace, warn};

/// Deterministic mock network interface.
///
/// Commands submitted by the executor thread become entries in an
/// append-only registry; the test driver takes the network role (via
/// [`enter_network`](Self::enter_network) or an [`InNetworkGuard`]),
/// observes them, schedules replies at chosen virtual times, and advances
/// the clock. Completions are delivered on the network thread in strict
/// time-then-insertion order.
///
/// Cloning yields another handle to the same interface.
#[derive(Clone)]
pub struct MockNetwork {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    state: Mutex<State>,
    /// Signaled when the network side may (re)claim the running role.
    wake_network: Condvar,
    /// Signaled when the executor may claim the running role.
    wake_executor: Condvar,
    shutting_down: AtomicBool,
    connection_hook: OnceLock<Box<dyn ConnectionHook>>,
    metadata_hook: OnceLock<Box<dyn MetadataHook>>,
}

struct State {
    clock: VirtualClock,
    registry: OperationRegistry,
    responses: ResponseQueue,
    alarms: AlarmHeap,
    coordinator: Coordinator,
    /// Hosts that have completed the simulated handshake.
    connections: HashSet<HostAndPort>,
    /// Canned handshake replies, per host.
    handshake_replies: HashMap<HostAndPort, CommandResponse>,
    has_started: bool,
    /// Next virtual instant the executor expects to wake at, from
    /// `wait_for_work_until`.
    executor_next_wakeup: Option<Duration>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    clock: VirtualClock::new(),
                    registry: OperationRegistry::new(),
                    responses: ResponseQueue::new(),
                    alarms: AlarmHeap::new(),
                    coordinator: Coordinator::new(),
                    connections: HashSet::new(),
                    handshake_replies: HashMap::new(),
                    has_started: false,
                    executor_next_wakeup: None,
                }),
                wake_network: Condvar::new(),
                wake_executor: Condvar::new(),
                shutting_down: AtomicBool::new(false),
                connection_hook: OnceLock::new(),
                metadata_hook: OnceLock::new(),
            }),
        }
    }

    /// Installs the connection hook. Must happen before `startup`.
    pub fn set_connection_hook(&self, hook: Box<dyn ConnectionHook>) {
        assert!(
            !self.lock().has_started,
            "hooks must be installed before startup"
        );
        assert!(
            self.inner.connection_hook.set(hook).is_ok(),
            "connection hook already installed"
        );
    }

    /// Installs the metadata hook. Must happen before `startup`.
    pub fn set_metadata_hook(&self, hook: Box<dyn MetadataHook>) {
        assert!(
            !self.lock().has_started,
            "hooks must be installed before startup"
        );
        assert!(
            self.inner.metadata_hook.set(hook).is_ok(),
            "metadata hook already installed"
        );
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    // ── Executor-facing API ──

    /// Starts the interface: the calling side holds the executor role until
    /// it first parks in `wait_for_work`. Idempotent.
    pub fn startup(&self) {
        let mut state = self.lock();
        if state.has_started {
            return;
        }
        assert_eq!(
            state.coordinator.running,
            Running::None,
            "startup while a role is active"
        );
        state.has_started = true;
        state.coordinator.running = Running::Executor;
        debug!("mock network interface started");
    }

    /// Shuts down: every live operation completes with `ShutdownInProgress`,
    /// pending alarms fire with `CallbackCanceled`, and the response queue
    /// drains on this thread. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = self.lock();
        let now = guard.clock.now();
        debug!(?now, "shutting down; failing pending work");

        // Every operation that is not finished and has no delivery scheduled
        // gets a shutdown response at virtual-now.
        let pending: Vec<OperationRef> = guard
            .registry
            .refs()
            .filter(|r| {
                guard.registry.get(*r).state() != OpState::Finished
                    && !guard.responses.contains_op(*r)
            })
            .collect();
        for opref in pending {
            schedule_response_locked(&mut guard, opref, now, Err(CommandError::ShutdownInProgress));
        }

        // Pending alarms fire with CallbackCanceled; internal timeout
        // markers are moot and simply drop.
        for alarm in guard.alarms.drain() {
            if let AlarmKind::Action(action) = alarm.kind {
                drop(guard);
                run_alarm_action(action, Err(CommandError::CallbackCanceled));
                guard = self.lock();
            }
        }

        // Drain every delivery on this thread, including future-dated ones.
        while let Some(delivery) = guard.responses.pop_front_any() {
            guard = self.inner.deliver(guard, delivery);
        }

        guard.coordinator.executor_waiting = true;
        self.inner.wake_executor.notify_all();
        self.inner.wake_network.notify_all();
        debug!("shutdown complete");
    }

    /// True once shutdown has begun.
    pub fn in_shutdown(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.lock().clock.now()
    }

    /// Submits a remote command; `on_finish` runs exactly once, on the
    /// network thread, when a reply is delivered.
    pub fn start_command(
        &self,
        id: CallbackId,
        request: CommandRequest,
        on_finish: CommandCallback,
    ) -> Result<(), CommandError> {
        self.start_command_impl(id, request, ResponseAction::Once(Some(on_finish)))
    }

    /// Submits an exhaust command; `on_reply` runs once per scheduled reply
    /// until a terminal one (an error, or `more_to_come == false`) arrives.
    pub fn start_exhaust_command(
        &self,
        id: CallbackId,
        request: CommandRequest,
        on_reply: ExhaustCallback,
    ) -> Result<(), CommandError> {
        self.start_command_impl(id, request, ResponseAction::Stream(on_reply))
    }

    fn start_command_impl(
        &self,
        id: CallbackId,
        mut request: CommandRequest,
        action: ResponseAction,
    ) -> Result<(), CommandError> {
        if self.in_shutdown() {
            return Err(CommandError::ShutdownInProgress);
        }
        if let Some(hook) = self.inner.metadata_hook.get() {
            hook.write_request_metadata(&mut request)?;
        }
        let Some(target) = request.target().cloned() else {
            panic!("command request names no target host");
        };

        let mut state = self.lock();
        if self.in_shutdown() {
            return Err(CommandError::ShutdownInProgress);
        }
        let now = state.clock.now();
        let op = Operation::new(id, request, now, action);
        trace!(id = id.raw(), target = %target, "command submitted");

        let hook = self.inner.connection_hook.get();
        let connected = state.connections.contains(&target);
        if hook.is_none() || connected {
            state.connections.insert(target);
            enqueue_operation(&mut state, op);
            return Ok(());
        }

        // First contact with this host: run the simulated handshake. The
        // validator sees the canned reply (or the default empty success)
        // with the lock released.
        let Some(hook) = hook else { unreachable!() };
        let reply = state
            .handshake_replies
            .get(&target)
            .cloned()
            .unwrap_or_default();
        drop(state);

        if let Err(err) = hook.validate_host(&target, &reply) {
            debug!(target = %target, %err, "handshake validation failed");
            op.into_response_action().invoke(Err(err));
            return Ok(());
        }
        let follow_up = match hook.post_connect_request(&target) {
            Ok(follow_up) => follow_up,
            Err(err) => {
                op.into_response_action().invoke(Err(err));
                return Ok(());
            }
        };

        let mut state = self.lock();
        match follow_up {
            None => {
                state.connections.insert(target);
                enqueue_operation(&mut state, op);
            }
            Some(follow_request) => {
                // Issue the follow-up ahead of the user's command, under the
                // same id so cancellation reaches it. Its completion releases
                // the held operation.
                trace!(target = %target, "issuing post-connect command");
                let weak = Arc::downgrade(&self.inner);
                let host = target.clone();
                let chained: CommandCallback = Box::new(move |result| {
                    let Some(inner) = weak.upgrade() else { return };
                    complete_post_connect(&inner, &host, op, result);
                });
                let now = state.clock.now();
                let follow_op =
                    Operation::new(id, follow_request, now, ResponseAction::Once(Some(chained)));
                enqueue_operation(&mut state, follow_op);
            }
        }
        Ok(())
    }

    /// Requests cancellation: a pending operation gets a `CallbackCanceled`
    /// response at virtual-now. An operation with a delivery already
    /// scheduled keeps it; finished or unknown ids are a no-op.
    pub fn cancel_command(&self, id: CallbackId) {
        let mut state = self.lock();
        trace!(id = id.raw(), "cancel requested");
        interrupt_with_response(&mut state, id, CommandError::CallbackCanceled);
    }

    /// Schedules `action` at `when`. A past or present `when` runs the
    /// action synchronously with `Ok(())` on the calling thread.
    pub fn set_alarm(
        &self,
        id: CallbackId,
        when: Duration,
        action: AlarmAction,
    ) -> Result<(), CommandError> {
        if self.in_shutdown() {
            return Err(CommandError::ShutdownInProgress);
        }
        let mut state = self.lock();
        if when <= state.clock.now() {
            drop(state);
            run_alarm_action(action, Ok(()));
            return Ok(());
        }
        state.alarms.push(when, Some(id), AlarmKind::Action(action));
        Ok(())
    }

    /// Cancels a pending alarm. Unknown or already-fired ids are a no-op.
    pub fn cancel_alarm(&self, id: CallbackId) {
        self.lock().alarms.cancel(id);
    }

    /// Schedules `action` to run during the network side's next processing
    /// sweep with `Ok(())` — or with `CallbackCanceled` at shutdown. An
    /// anonymous alarm anchored at virtual-now.
    pub fn schedule(&self, action: AlarmAction) -> Result<(), CommandError> {
        if self.in_shutdown() {
            return Err(CommandError::ShutdownInProgress);
        }
        let mut state = self.lock();
        let now = state.clock.now();
        state.alarms.push(now, None, AlarmKind::Action(action));
        Ok(())
    }

    /// Marks the executor as having work, waking it if it is parked.
    pub fn signal_work_available(&self) {
        let mut state = self.lock();
        state.coordinator.executor_waiting = true;
        if state.coordinator.running == Running::None {
            self.inner.wake_executor.notify_one();
        }
    }

    /// Parks the executor thread until work is signaled.
    pub fn wait_for_work(&self) {
        let mut guard = self.lock();
        guard.executor_next_wakeup = None;
        let _guard = self.inner.park_executor(guard);
    }

    /// Parks the executor thread until work is signaled or virtual time
    /// reaches `deadline`. Returns immediately if `deadline` has passed.
    pub fn wait_for_work_until(&self, deadline: Duration) {
        let mut guard = self.lock();
        guard.executor_next_wakeup = Some(deadline);
        if deadline <= guard.clock.now() {
            return;
        }
        let _guard = self.inner.park_executor(guard);
    }

    /// True if the calling thread holds the network role.
    pub fn on_network_thread(&self) -> bool {
        self.lock().coordinator.holds_network()
    }

    // ── Test-driver API (network role) ──

    /// Takes the network role, blocking until the executor side is quiesced.
    /// Panics if the calling thread already holds the role.
    pub fn enter_network(&self) {
        let me = thread::current().id();
        let mut guard = self.lock();
        assert!(
            guard.coordinator.network_thread != Some(me),
            "enter_network called by the thread already holding the network role"
        );
        guard.coordinator.network_waiting = true;
        while !guard.coordinator.network_claimable() {
            guard = self.inner.wake_network.wait(guard).unwrap();
        }
        guard.coordinator.claim_network();
        trace!("network role acquired");
    }

    /// Releases the network role. No-op unless the calling thread holds it.
    pub fn exit_network(&self) {
        let mut guard = self.lock();
        if !guard.coordinator.holds_network() {
            return;
        }
        guard.coordinator.release_network();
        if guard.coordinator.executor_runnable() {
            self.inner.wake_executor.notify_one();
        }
        self.inner.wake_network.notify_all();
        trace!("network role released");
    }

    /// Takes the network role for a scope; released when the guard drops.
    pub fn enter_network_guard(&self) -> InNetworkGuard<'_> {
        InNetworkGuard::new(self)
    }

    /// True iff at least one operation has been submitted and not yet
    /// observed. Exhaust operations awaiting further replies do not count.
    pub fn has_ready_requests(&self) -> bool {
        let state = self.lock();
        state.coordinator.assert_network_role();
        state.registry.first_unscheduled().is_some()
    }

    /// True if scheduled work — queued responses or live alarms — is
    /// pending for the network thread.
    pub fn has_ready_network_operations(&self) -> bool {
        let state = self.lock();
        !state.responses.is_empty() || state.alarms.live_len() > 0
    }

    /// Takes the oldest unscheduled operation, transitioning it to
    /// processing. Blocks — yielding to the executor — until one exists and
    /// the executor is parked.
    pub fn get_next_ready_request(&self) -> OperationRef {
        let mut guard = self.lock();
        guard.coordinator.assert_network_role();
        loop {
            if let Some(opref) = guard.registry.first_unscheduled() {
                guard.registry.get_mut(opref).mark_processing();
                trace!("ready request handed to network thread");
                return opref;
            }
            guard.coordinator.executor_waiting = true;
            guard = self.inner.run_ready_ops(guard);
        }
    }

    /// Non-blocking peek at the oldest unscheduled operation. Panics if
    /// there is none.
    pub fn front_of_unscheduled_queue(&self) -> OperationRef {
        self.nth_unscheduled_request(0)
    }

    /// Non-blocking peek at the n-th (0-based) unscheduled operation.
    /// Panics unless at least n+1 unscheduled operations are present.
    pub fn nth_unscheduled_request(&self, n: usize) -> OperationRef {
        let state = self.lock();
        state.coordinator.assert_network_role();
        state
            .registry
            .nth_unscheduled(n)
            .unwrap_or_else(|| panic!("no unscheduled request at index {n}"))
    }

    /// The request that initiated `op`.
    pub fn request_for(&self, op: OperationRef) -> CommandRequest {
        self.lock().registry.get(op).request().clone()
    }

    /// Schedules `result` for delivery to `op` at virtual time `when`.
    /// `when` must not be in the past, and `op` must not be blackholed.
    pub fn schedule_response(&self, op: OperationRef, when: Duration, result: CommandResult) {
        let mut state = self.lock();
        state.coordinator.assert_network_role();
        assert!(
            when >= state.clock.now(),
            "response scheduled in the past: {:?} < {:?}",
            when,
            state.clock.now()
        );
        assert!(
            state.registry.get(op).state() != OpState::Blackholed,
            "response scheduled for a blackholed operation"
        );
        schedule_response_locked(&mut state, op, when, result);
    }

    /// Pops the next ready request and schedules a success reply carrying
    /// `body` at virtual-now. Returns the popped request for assertions.
    pub fn schedule_successful_response(&self, body: serde_json::Value) -> CommandRequest {
        let op = self.get_next_ready_request();
        self.schedule_successful_response_for(op, CommandResponse::new(body))
    }

    /// Schedules a success reply for `op` at virtual-now.
    pub fn schedule_successful_response_for(
        &self,
        op: OperationRef,
        response: CommandResponse,
    ) -> CommandRequest {
        let when = self.now();
        self.schedule_successful_response_at(op, when, response)
    }

    /// Schedules a success reply for `op` at `when`.
    pub fn schedule_successful_response_at(
        &self,
        op: OperationRef,
        when: Duration,
        response: CommandResponse,
    ) -> CommandRequest {
        self.schedule_response(op, when, Ok(response));
        self.request_for(op)
    }

    /// Pops the next ready request and schedules `error` at virtual-now.
    pub fn schedule_error_response(&self, error: CommandError) -> CommandRequest {
        let op = self.get_next_ready_request();
        self.schedule_error_response_for(op, error)
    }

    /// Schedules `error` for `op` at virtual-now.
    pub fn schedule_error_response_for(
        &self,
        op: OperationRef,
        error: CommandError,
    ) -> CommandRequest {
        let when = self.now();
        self.schedule_error_response_at(op, when, error)
    }

    /// Schedules `error` for `op` at `when`.
    pub fn schedule_error_response_at(
        &self,
        op: OperationRef,
        when: Duration,
        error: CommandError,
    ) -> CommandRequest {
        self.schedule_response(op, when, Err(error));
        self.request_for(op)
    }

    /// Swallows `op`: it stays pending and receives no reply until shutdown
    /// completes it.
    pub fn black_hole(&self, op: OperationRef) {
        let mut state = self.lock();
        state.coordinator.assert_network_role();
        state.registry.get_mut(op).mark_blackholed();
        debug!("operation blackholed");
    }

    /// Runs the simulation forward until `deadline`, or until an
    /// unscheduled request appears, whichever is first. Returns virtual-now.
    pub fn run_until(&self, deadline: Duration) -> Duration {
        let mut guard = self.lock();
        guard.coordinator.assert_network_role();
        assert!(
            deadline >= guard.clock.now(),
            "run_until deadline is in the past"
        );
        while guard.registry.first_unscheduled().is_none() && guard.clock.now() < deadline {
            guard = self.inner.step_clock(guard, deadline);
        }
        let now = guard.clock.now();
        debug!(?now, "run_until complete");
        now
    }

    /// Runs the simulation forward until `new_now`, with no short-circuit
    /// for ready requests.
    pub fn advance_time(&self, new_now: Duration) {
        let mut guard = self.lock();
        guard.coordinator.assert_network_role();
        assert!(
            new_now >= guard.clock.now(),
            "advance_time target is in the past"
        );
        while guard.clock.now() < new_now {
            guard = self.inner.step_clock(guard, new_now);
        }
    }

    /// Processes all due deliveries and alarms, then yields until the
    /// executor thread is parked again.
    pub fn run_ready_network_operations(&self) {
        let guard = self.lock();
        guard.coordinator.assert_network_role();
        drop(self.inner.run_ready_ops(guard));
    }

    /// Sets the canned handshake reply handed to the connection hook's
    /// validator on first contact with `host`. Persists until replaced.
    pub fn set_handshake_reply(&self, host: HostAndPort, reply: CommandResponse) {
        let mut state = self.lock();
        state.coordinator.assert_network_role();
        state.handshake_replies.insert(host, reply);
    }

    /// Human-readable snapshot of the interface state.
    pub fn diagnostic_string(&self) -> String {
        let state = self.lock();
        let counts = state.registry.state_counts();
        let mut hosts: Vec<String> = state.connections.iter().map(ToString::to_string).collect();
        hosts.sort();
        format!(
            "now={:?} operations[unscheduled={} processing={} blackholed={} finished={}] \
             responses={} alarms={} hosts=[{}]",
            state.clock.now(),
            counts.unscheduled,
            counts.processing,
            counts.blackholed,
            counts.finished,
            state.responses.len(),
            state.alarms.live_len(),
            hosts.join(", ")
        )
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInterface for MockNetwork {
    fn startup(&self) {
        MockNetwork::startup(self);
    }

    fn shutdown(&self) {
        MockNetwork::shutdown(self);
    }

    fn in_shutdown(&self) -> bool {
        MockNetwork::in_shutdown(self)
    }

    fn now(&self) -> Duration {
        MockNetwork::now(self)
    }

    fn host_name(&self) -> String {
        "localhost".to_string()
    }

    fn start_command(
        &self,
        id: CallbackId,
        request: CommandRequest,
        on_finish: CommandCallback,
    ) -> Result<(), CommandError> {
        MockNetwork::start_command(self, id, request, on_finish)
    }

    fn start_exhaust_command(
        &self,
        id: CallbackId,
        request: CommandRequest,
        on_reply: ExhaustCallback,
    ) -> Result<(), CommandError> {
        MockNetwork::start_exhaust_command(self, id, request, on_reply)
    }

    fn cancel_command(&self, id: CallbackId) {
        MockNetwork::cancel_command(self, id);
    }

    fn set_alarm(
        &self,
        id: CallbackId,
        when: Duration,
        action: AlarmAction,
    ) -> Result<(), CommandError> {
        MockNetwork::set_alarm(self, id, when, action)
    }

    fn cancel_alarm(&self, id: CallbackId) {
        MockNetwork::cancel_alarm(self, id);
    }

    fn schedule(&self, action: AlarmAction) -> Result<(), CommandError> {
        MockNetwork::schedule(self, action)
    }

    fn signal_work_available(&self) {
        MockNetwork::signal_work_available(self);
    }

    fn wait_for_work(&self) {
        MockNetwork::wait_for_work(self);
    }

    fn wait_for_work_until(&self, deadline: Duration) {
        MockNetwork::wait_for_work_until(self, deadline);
    }

    fn on_network_thread(&self) -> bool {
        MockNetwork::on_network_thread(self)
    }
}

impl Inner {
    /// Parks the calling (executor) thread until it is runnable again.
    ///
    /// If work was signaled while the executor was running, consume the bit
    /// and return without sleeping. Otherwise release the running role, let
    /// the network side know, and sleep until signaled and runnable.
    fn park_executor<'a>(&'a self, mut guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        if guard.coordinator.executor_waiting {
            guard.coordinator.executor_waiting = false;
            return guard;
        }
        guard.coordinator.running = Running::None;
        while !guard.coordinator.executor_runnable() {
            guard.coordinator.network_waiting = true;
            // notify_all: both a fresh enter_network and a mid-sweep resume
            // may be waiting; each rechecks its own claim condition.
            self.wake_network.notify_all();
            guard = self.wake_executor.wait(guard).unwrap();
        }
        guard.coordinator.running = Running::Executor;
        guard.coordinator.executor_waiting = false;
        guard
    }

    /// Processes everything due at virtual-now: deliveries first, then
    /// alarms, re-checking deliveries after each alarm so an interrupt
    /// response scheduled by a timeout lands in the same sweep. Returns
    /// only once the executor has no pending claim — i.e. it is parked in
    /// a `wait_for_work*` — so the caller observes a quiesced executor.
    fn run_ready_ops<'a>(&'a self, mut guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        loop {
            let now = guard.clock.now();
            if let Some(delivery) = guard.responses.pop_ready(now) {
                guard = self.deliver(guard, delivery);
                continue;
            }
            if let Some(alarm) = guard.alarms.pop_ready(now) {
                guard = self.fire_alarm(guard, alarm);
                continue;
            }
            break;
        }

        if !guard.coordinator.executor_waiting {
            return guard;
        }
        // Yield the running role until the executor has consumed its claim
        // and parked again. The reservation in `network_thread` keeps other
        // would-be network threads out meanwhile.
        guard.coordinator.running = Running::None;
        self.wake_executor.notify_one();
        guard.coordinator.network_waiting = true;
        while !guard.coordinator.network_resumable() {
            guard = self.wake_network.wait(guard).unwrap();
        }
        guard.coordinator.running = Running::Network;
        guard.coordinator.network_waiting = false;
        guard
    }

    /// Delivers one queued response: runs the metadata hook and the
    /// completion callback with the lock released, and settles the
    /// operation's state.
    fn deliver<'a>(
        &'a self,
        mut guard: MutexGuard<'a, State>,
        delivery: PendingDelivery,
    ) -> MutexGuard<'a, State> {
        let PendingDelivery { op: opref, result } = delivery;
        if guard.registry.get(opref).state() == OpState::Finished {
            return guard;
        }
        guard.coordinator.executor_waiting = true;
        self.wake_executor.notify_one();
        drop(guard);

        // Metadata inspection happens outside the lock; an error here
        // replaces the reply and is terminal.
        let result = match result {
            Ok(response) => match self.metadata_hook.get() {
                Some(hook) => hook.read_reply_metadata(&response).map(|()| response),
                None => Ok(response),
            },
            Err(err) => Err(err),
        };

        let mut guard = self.state.lock().unwrap();
        let op = guard.registry.get_mut(opref);
        if op.state() == OpState::Finished {
            return guard;
        }
        let Some(mut action) = op.take_response_action() else {
            return guard;
        };
        let terminal = match &result {
            Err(_) => true,
            Ok(response) => action.is_once() || !response.more_to_come,
        };
        let id = op.id().raw();
        if terminal {
            op.mark_finished();
            debug!(id, "operation finished");
        } else {
            trace!(id, "exhaust reply delivered, operation still processing");
        }
        drop(guard);
        action.invoke(result);
        let mut guard = self.state.lock().unwrap();
        if !terminal {
            guard.registry.get_mut(opref).put_back_response_action(action);
        }
        guard
    }

    /// Fires one due alarm.
    fn fire_alarm<'a>(
        &'a self,
        mut guard: MutexGuard<'a, State>,
        alarm: Alarm,
    ) -> MutexGuard<'a, State> {
        match alarm.kind {
            AlarmKind::CommandTimeout(id) => {
                trace!(id = id.raw(), "per-attempt timeout elapsed");
                interrupt_with_response(&mut guard, id, CommandError::NetworkTimeout);
                guard
            }
            AlarmKind::Action(action) => {
                guard.coordinator.executor_waiting = true;
                self.wake_executor.notify_one();
                drop(guard);
                trace!(when = ?alarm.when, "alarm fired");
                run_alarm_action(action, Ok(()));
                self.state.lock().unwrap()
            }
        }
    }

    /// Advances the clock one boundary toward `target` and sweeps. The next
    /// boundary is the earliest of: the target, the executor's wakeup
    /// deadline, the next live alarm, and the next queued delivery.
    fn step_clock<'a>(
        &'a self,
        mut guard: MutexGuard<'a, State>,
        target: Duration,
    ) -> MutexGuard<'a, State> {
        let now = guard.clock.now();
        let mut next = target;
        if let Some(wakeup) = guard.executor_next_wakeup.filter(|w| *w > now) {
            next = next.min(wakeup);
        }
        if let Some(when) = guard.alarms.next_when() {
            next = next.min(when);
        }
        if let Some(when) = guard.responses.front_when() {
            next = next.min(when);
        }
        let next = next.max(now);
        guard.clock.advance_to(next);
        trace!(now = ?next, "virtual time advanced");
        // Every step hands the executor a chance to observe the new time.
        guard.coordinator.executor_waiting = true;
        self.run_ready_ops(guard)
    }
}

/// Registers `op` and arms its per-attempt timeout, if any.
fn enqueue_operation(state: &mut State, op: Operation) -> OperationRef {
    let id = op.id();
    let request_date = op.request_date();
    let timeout = op.request().timeout;
    let opref = state.registry.append(op);
    if let Some(timeout) = timeout {
        let deadline = request_date + timeout;
        if deadline <= state.clock.now() {
            interrupt_with_response(state, id, CommandError::NetworkTimeout);
        } else {
            state
                .alarms
                .push(deadline, Some(id), AlarmKind::CommandTimeout(id));
        }
    }
    trace!(id = id.raw(), "operation registered");
    opref
}

/// Shared interrupt path for cancellation, timeout, and shutdown: delivers
/// `err` to the first live operation under `id` unless a delivery is
/// already scheduled (the existing delivery wins) or the operation is
/// blackholed (only shutdown answers those).
fn interrupt_with_response(state: &mut State, id: CallbackId, err: CommandError) {
    let Some(opref) = state.registry.find_active(id) else {
        return;
    };
    if state.responses.contains_op(opref) {
        return;
    }
    if state.registry.get(opref).state() == OpState::Blackholed {
        return;
    }
    let now = state.clock.now();
    trace!(id = id.raw(), %err, "interrupting operation");
    schedule_response_locked(state, opref, now, Err(err));
}

/// Enqueues a delivery and moves the operation out of the ready set. A
/// successful response gets its elapsed time stamped here.
fn schedule_response_locked(
    state: &mut State,
    opref: OperationRef,
    when: Duration,
    mut result: CommandResult,
) {
    let op = state.registry.get_mut(opref);
    op.mark_processing();
    if let Ok(response) = &mut result {
        response.elapsed = Some(when.saturating_sub(op.request_date()));
    }
    state.responses.push(when, opref, result);
    trace!(when = ?when, "response scheduled");
}

/// Completion handler for a post-connect command: a failure (or a rejected
/// reply) fails the held user operation; success marks the host connected
/// and releases it.
fn complete_post_connect(
    inner: &Arc<Inner>,
    host: &HostAndPort,
    op: Operation,
    result: CommandResult,
) {
    match result {
        Err(err) => {
            debug!(host = %host, %err, "post-connect command failed");
            op.into_response_action().invoke(Err(err));
        }
        Ok(reply) => {
            let checked = match inner.connection_hook.get() {
                Some(hook) => hook.handle_post_connect_reply(host, &reply),
                None => Ok(()),
            };
            match checked {
                Err(err) => {
                    debug!(host = %host, %err, "post-connect reply rejected");
                    op.into_response_action().invoke(Err(err));
                }
                Ok(()) => {
                    let mut state = inner.state.lock().unwrap();
                    state.connections.insert(host.clone());
                    enqueue_operation(&mut state, op);
                }
            }
        }
    }
}

/// Runs a user alarm action, containing any panic to this thread.
fn run_alarm_action(action: AlarmAction, status: Result<(), CommandError>) {
    if panic::catch_unwind(AssertUnwindSafe(move || action(status))).is_err() {
        warn!("alarm action panicked");
    }
}
