//! End-to-end command lifecycle scenarios.
//!
//! Each test runs a real executor thread parked in `wait_for_work` loops
//! while the test thread drives the network side. Completion callbacks
//! report through crossbeam channels so the test can assert on exact
//! delivery order and timing.

use crossbeam::channel::{unbounded, Receiver};
use serde_json::json;
use std::thread;
use std::time::Duration;
use tasknet_network::{CommandError, CommandResult, ConnectionHook};
use tasknet_network_mock::MockNetwork;
use tasknet_types::{CallbackId, CommandRequest, CommandResponse, HostAndPort};
use tracing_test::traced_test;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn host_a() -> HostAndPort {
    HostAndPort::new("host-a", 27017)
}

fn request() -> CommandRequest {
    CommandRequest::new(host_a(), "admin", json!({"find": "coll"}))
}

/// Parks the executor thread until shutdown.
fn spawn_executor(net: MockNetwork) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !net.in_shutdown() {
            net.wait_for_work();
        }
    })
}

/// Connection hook that accepts every host and issues a handshake command
/// ahead of the first user command.
struct Handshaker;

impl ConnectionHook for Handshaker {
    fn validate_host(
        &self,
        _host: &HostAndPort,
        _handshake_reply: &CommandResponse,
    ) -> Result<(), CommandError> {
        Ok(())
    }

    fn post_connect_request(
        &self,
        host: &HostAndPort,
    ) -> Result<Option<CommandRequest>, CommandError> {
        Ok(Some(CommandRequest::new(
            host.clone(),
            "admin",
            json!({"isMaster": 1}),
        )))
    }

    fn handle_post_connect_reply(
        &self,
        _host: &HostAndPort,
        _reply: &CommandResponse,
    ) -> Result<(), CommandError> {
        Ok(())
    }
}

fn submit(
    net: &MockNetwork,
    id: u64,
    request: CommandRequest,
) -> Receiver<(CommandResult, Duration)> {
    let (tx, rx) = unbounded();
    let observer = net.clone();
    net.start_command(
        CallbackId::new(id),
        request,
        Box::new(move |result| {
            tx.send((result, observer.now())).unwrap();
        }),
    )
    .unwrap();
    rx
}

#[test]
#[traced_test]
fn simple_success_with_handshake() {
    let net = MockNetwork::new();
    net.set_connection_hook(Box::new(Handshaker));
    net.startup();
    let executor = spawn_executor(net.clone());

    let rx = submit(&net, 1, request());

    let guard = net.enter_network_guard();
    // The handshake command runs ahead of the user command.
    let handshake = guard.get_next_ready_request();
    assert_eq!(guard.request_for(handshake).body, json!({"isMaster": 1}));
    guard.schedule_successful_response_for(handshake, CommandResponse::default());
    guard.run_ready_network_operations();

    // Handshake complete: the user command is now visible.
    assert!(guard.has_ready_requests());
    let op = guard.get_next_ready_request();
    assert_eq!(guard.request_for(op).body, json!({"find": "coll"}));
    guard.schedule_successful_response_at(op, ms(5), CommandResponse::new(json!({"ok": 1})));
    assert_eq!(guard.run_until(ms(10)), ms(10));
    drop(guard);

    let (result, _) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let response = result.unwrap();
    assert_eq!(response.body, json!({"ok": 1}));
    assert_eq!(response.elapsed, Some(ms(5)));
    assert!(rx.is_empty(), "completion must be delivered exactly once");

    net.shutdown();
    executor.join().unwrap();
}

#[test]
fn cancellation_before_observation() {
    let net = MockNetwork::new();
    net.startup();
    let executor = spawn_executor(net.clone());

    let rx = submit(&net, 1, request());
    net.cancel_command(CallbackId::new(1));

    let guard = net.enter_network_guard();
    guard.run_ready_network_operations();
    assert!(!guard.has_ready_requests());
    drop(guard);

    let (result, _) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(result, Err(CommandError::CallbackCanceled));
    assert!(rx.is_empty());

    net.shutdown();
    executor.join().unwrap();
}

#[test]
fn timeout_fires_at_deadline() {
    let net = MockNetwork::new();
    net.startup();
    let executor = spawn_executor(net.clone());

    let rx = submit(&net, 1, request().with_timeout(ms(100)));

    let guard = net.enter_network_guard();
    guard.advance_time(ms(10));
    let _op = guard.get_next_ready_request();
    // No response scheduled; the per-attempt timeout answers instead.
    guard.advance_time(ms(200));
    drop(guard);

    let (result, observed_now) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(result, Err(CommandError::NetworkTimeout));
    assert_eq!(observed_now, ms(100), "timeout must fire when it elapses");
    assert!(rx.is_empty());

    net.shutdown();
    executor.join().unwrap();
}

#[test]
fn timeout_yields_to_scheduled_response() {
    let net = MockNetwork::new();
    net.startup();
    let executor = spawn_executor(net.clone());

    let rx = submit(&net, 1, request().with_timeout(ms(100)));

    let guard = net.enter_network_guard();
    let op = guard.get_next_ready_request();
    guard.schedule_successful_response_at(op, ms(50), CommandResponse::new(json!({"ok": 1})));
    guard.advance_time(ms(200));
    drop(guard);

    let (result, _) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(result.unwrap().body, json!({"ok": 1}));
    assert!(rx.is_empty(), "the timeout must not double-deliver");

    net.shutdown();
    executor.join().unwrap();
}

#[test]
fn blackholed_operation_survives_until_shutdown() {
    let net = MockNetwork::new();
    net.startup();
    let executor = spawn_executor(net.clone());

    let rx = submit(&net, 1, request());

    let guard = net.enter_network_guard();
    let op = guard.get_next_ready_request();
    guard.black_hole(op);
    guard.advance_time(ms(10_000));
    drop(guard);

    assert!(rx.is_empty(), "a blackholed operation never completes on its own");

    net.shutdown();
    let (result, _) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(result, Err(CommandError::ShutdownInProgress));
    executor.join().unwrap();
}

#[test]
fn responses_precede_alarms_at_equal_time() {
    let net = MockNetwork::new();
    net.startup();
    let executor = spawn_executor(net.clone());

    let (events_tx, events_rx) = unbounded();
    let alarm_tx = events_tx.clone();
    net.set_alarm(
        CallbackId::new(10),
        ms(50),
        Box::new(move |status| {
            assert!(status.is_ok());
            alarm_tx.send("alarm").unwrap();
        }),
    )
    .unwrap();

    let response_tx = events_tx;
    net.start_command(
        CallbackId::new(1),
        request(),
        Box::new(move |result| {
            assert!(result.is_ok());
            response_tx.send("response").unwrap();
        }),
    )
    .unwrap();

    let guard = net.enter_network_guard();
    let op = guard.get_next_ready_request();
    guard.schedule_successful_response_at(op, ms(50), CommandResponse::default());
    guard.run_until(ms(100));
    drop(guard);

    assert_eq!(events_rx.recv_timeout(RECV_TIMEOUT).unwrap(), "response");
    assert_eq!(events_rx.recv_timeout(RECV_TIMEOUT).unwrap(), "alarm");

    net.shutdown();
    executor.join().unwrap();
}

#[test]
fn exhaust_stream_delivers_in_order() {
    let net = MockNetwork::new();
    net.startup();
    let executor = spawn_executor(net.clone());

    let (tx, rx) = unbounded();
    net.start_exhaust_command(
        CallbackId::new(1),
        request(),
        Box::new(move |result| {
            tx.send(result).unwrap();
        }),
    )
    .unwrap();

    let guard = net.enter_network_guard();
    let op = guard.get_next_ready_request();
    guard.schedule_response(
        op,
        ms(10),
        Ok(CommandResponse::new(json!({"n": 1})).with_more_to_come()),
    );
    guard.schedule_response(
        op,
        ms(20),
        Ok(CommandResponse::new(json!({"n": 2})).with_more_to_come()),
    );
    guard.schedule_response(op, ms(30), Ok(CommandResponse::new(json!({"n": 3}))));
    guard.run_until(ms(40));
    let diag = guard.diagnostic_string();
    assert!(diag.contains("finished=1"), "diagnostic: {diag}");
    drop(guard);

    for expected in 1..=3 {
        let reply = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
        assert_eq!(reply.body, json!({"n": expected}));
        assert_eq!(reply.more_to_come, expected != 3);
    }
    assert!(rx.is_empty());

    net.shutdown();
    executor.join().unwrap();
}

#[test]
fn exhaust_stays_processing_between_replies() {
    let net = MockNetwork::new();
    net.startup();
    let executor = spawn_executor(net.clone());

    let (tx, rx) = unbounded();
    net.start_exhaust_command(
        CallbackId::new(1),
        request(),
        Box::new(move |result| {
            tx.send(result).unwrap();
        }),
    )
    .unwrap();

    let guard = net.enter_network_guard();
    let op = guard.get_next_ready_request();
    guard.schedule_response(
        op,
        ms(10),
        Ok(CommandResponse::new(json!({"n": 1})).with_more_to_come()),
    );
    guard.run_until(ms(15));
    // A processing exhaust operation is not a ready request.
    assert!(!guard.has_ready_requests());
    // Further replies may still be scheduled on the same operation.
    guard.schedule_response(op, ms(20), Ok(CommandResponse::new(json!({"n": 2}))));
    guard.run_until(ms(25));
    drop(guard);

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap().body, json!({"n": 1}));
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap().body, json!({"n": 2}));

    net.shutdown();
    executor.join().unwrap();
}
