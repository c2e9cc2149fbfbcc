//! Integration tests for the broker listener and its channel.
//!
//! These tests run a [`BrokerListener`] against the in-process broker and
//! exercise the full flow:
//! - Lazy creation of connection, session and consumer
//! - Delivery thread → decode → dispatch → channel queue
//! - Blocking, timed and asynchronous accept/receive
//! - Channel and listener teardown, including injected failures

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use wharf_transport::{
    BrokerError, BrokerListener, BrokerResource, CommunicationState, CompletionToken,
    DispatchOutcome, InMemoryBroker, InputChannel, JsonEncoder, ListenerConfig, Message,
    MessageEncoder, RawEncoder, Received, TransportError, UsageError,
};

const ADDRESS: &str = "wharf://localhost:61616/queue/orders";
const LONG: Duration = Duration::from_secs(5);

type JsonListener = BrokerListener<InMemoryBroker, JsonEncoder>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn open_listener() -> (InMemoryBroker, JsonListener) {
    init_tracing();
    let broker = InMemoryBroker::new();
    let listener = BrokerListener::new(ListenerConfig::new(ADDRESS), broker.clone(), JsonEncoder);
    listener.open(LONG).expect("open");
    (broker, listener)
}

fn publish(broker: &InMemoryBroker, id: &str, body: &str) {
    let frame = JsonEncoder
        .encode(&Message::text(id, body))
        .expect("encode");
    broker.publish("orders", frame);
}

#[test]
fn test_dispatch_without_channel_creates_and_delivers_once() {
    let (broker, listener) = open_listener();

    let outcome = listener.dispatch(Some(Message::text("M1", "first")));
    assert_eq!(outcome, DispatchOutcome::Delivered { created: true });
    assert!(listener.has_live_channel());
    assert_eq!(listener.pending_accept_count(), 1);

    let channel = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");
    let message = channel.receive(LONG).expect("receive").expect("message");
    assert_eq!(message.id, "M1");
    assert_eq!(channel.try_receive(Duration::ZERO), Received::TimedOut);

    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(broker.consumers_opened(), 1);
}

#[test]
fn test_blocked_receive_returns_when_message_arrives() {
    let (broker, listener) = open_listener();
    let channel = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");

    let publisher = broker.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_secs(1));
        publish(&publisher, "M2", "second");
    });

    let start = Instant::now();
    let message = channel
        .receive(Duration::from_secs(5))
        .expect("receive")
        .expect("message");
    let elapsed = start.elapsed();

    assert_eq!(message.id, "M2");
    assert!(elapsed >= Duration::from_millis(900), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "waited for the full timeout: {elapsed:?}");
    handle.join().expect("publisher");
}

#[test]
fn test_closing_channel_discards_buffer_and_detaches() {
    let (broker, listener) = open_listener();
    for i in 0..3 {
        listener.dispatch(Some(Message::text(format!("m{i}"), "x")));
    }
    let channel = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");
    assert_eq!(channel.pending_message_count(), 3);

    channel.close();

    assert_eq!(channel.pending_message_count(), 0);
    assert_eq!(channel.state(), CommunicationState::Closed);
    assert!(!listener.has_live_channel());
    assert_eq!(
        broker.teardown_log(),
        vec![
            BrokerResource::Consumer,
            BrokerResource::Session,
            BrokerResource::Connection
        ]
    );

    let outcome = listener.dispatch(Some(Message::text("fresh", "x")));
    assert_eq!(outcome, DispatchOutcome::Delivered { created: true });
    assert_eq!(broker.consumers_opened(), 2);

    let next = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");
    assert_ne!(next.id(), channel.id());
    assert_eq!(
        next.receive(LONG).expect("receive").map(|m| m.id),
        Some("fresh".to_string())
    );
}

#[test]
fn test_accept_with_zero_timeout_times_out_once_claimed() {
    let (_broker, listener) = open_listener();
    let _channel = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");

    let start = Instant::now();
    let err = listener
        .accept_channel(Duration::ZERO)
        .expect_err("no channel left to accept");
    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_millis(250));
}

#[test]
fn test_close_releases_blocked_accept_and_receive() {
    let (_broker, listener) = open_listener();
    let channel = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");

    let receiver = channel.clone();
    let blocked_receive = thread::spawn(move || receiver.receive(LONG));
    let acceptor = listener.clone();
    let blocked_accept = thread::spawn(move || acceptor.accept_channel(LONG));

    thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    listener.close(LONG).expect("close");

    let received = blocked_receive.join().expect("receiver thread");
    let accepted = blocked_accept.join().expect("acceptor thread");
    assert!(matches!(received, Ok(None)), "receive: {received:?}");
    assert!(matches!(accepted, Ok(None)), "accept: {accepted:?}");
    assert!(start.elapsed() < LONG);

    assert_eq!(listener.state(), CommunicationState::Closed);
    assert_eq!(
        listener.dispatch(Some(Message::text("late", "x"))),
        DispatchOutcome::Failed
    );
    assert!(matches!(listener.accept_channel(LONG), Ok(None)));
    listener.close(LONG).expect("close is idempotent");
}

#[test]
fn test_listener_close_tears_down_in_order() {
    let (broker, listener) = open_listener();
    listener.ensure_channel().expect("create");

    listener.close(LONG).expect("close");

    assert_eq!(
        broker.teardown_log(),
        vec![
            BrokerResource::Consumer,
            BrokerResource::Session,
            BrokerResource::Connection
        ]
    );
    assert!(!listener.has_live_channel());
}

#[test]
fn test_teardown_failure_does_not_stop_later_steps() {
    let (broker, listener) = open_listener();
    listener.ensure_channel().expect("create");
    broker.fail_close(BrokerResource::Consumer);
    broker.fail_close(BrokerResource::Session);

    listener.close(LONG).expect("best-effort close succeeds");

    assert_eq!(broker.teardown_log().len(), 3);
    assert_eq!(listener.state(), CommunicationState::Closed);
}

#[test]
fn test_abort_never_fails() {
    let (broker, listener) = open_listener();
    let channel = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");
    broker.fail_close(BrokerResource::Consumer);
    broker.fail_close(BrokerResource::Session);
    broker.fail_close(BrokerResource::Connection);

    listener.abort();
    listener.abort();

    assert_eq!(listener.state(), CommunicationState::Aborted);
    assert_eq!(channel.state(), CommunicationState::Aborted);
    assert_eq!(broker.teardown_log().len(), 3);
}

#[test]
fn test_recoverable_broker_error_is_swallowed() {
    let (broker, listener) = open_listener();
    let channel = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");

    assert_eq!(broker.raise_exception(BrokerError::Transient("failover".into())), 1);

    assert_eq!(listener.state(), CommunicationState::Opened);
    publish(&broker, "after", "blip");
    assert_eq!(
        channel.receive(LONG).expect("receive").map(|m| m.id),
        Some("after".to_string())
    );
}

#[test]
fn test_fatal_broker_error_faults_listener() {
    let (broker, listener) = open_listener();
    let channel = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");

    broker.raise_exception(BrokerError::Fatal("cluster lost".into()));

    assert_eq!(listener.state(), CommunicationState::Faulted);
    assert!(matches!(
        listener.fault(),
        Some(TransportError::Faulted { message }) if message.contains("cluster lost")
    ));
    assert!(matches!(
        listener.accept_channel(LONG),
        Err(TransportError::Faulted { .. })
    ));
    assert_eq!(channel.state(), CommunicationState::Aborted);
    assert_eq!(broker.teardown_log().len(), 3);
}

#[test]
fn test_async_accept_after_channel_close_creates_fresh_channel() {
    let (broker, listener) = open_listener();
    let first = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");
    first.close();

    let (tx, rx) = mpsc::channel();
    let token = listener.begin_accept_channel(
        LONG,
        Some(Box::new(move |t: &CompletionToken<Option<InputChannel>>| {
            let _ = tx.send(t.completed_synchronously());
        })),
        None,
    );
    assert!(token.completed_synchronously());

    let channel = listener
        .end_accept_channel(&token)
        .expect("accept")
        .expect("fresh channel");
    assert_ne!(channel.id(), first.id());
    assert!(rx.recv_timeout(LONG).expect("callback ran"));
    assert_eq!(broker.consumers_opened(), 2);
}

#[test]
fn test_async_accept_waits_until_channel_published() {
    let (_broker, listener) = open_listener();
    let _claimed = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");

    let token = listener.begin_accept_channel(Duration::from_millis(30), None, None);
    assert!(!token.completed_synchronously());

    let err = listener.end_accept_channel(&token).expect_err("nothing published");
    assert!(err.is_timeout());
}

#[test]
fn test_accept_token_of_another_listener_is_rejected() {
    let (_broker_a, a) = open_listener();
    let (_broker_b, b) = open_listener();
    let token = a.begin_accept_channel(LONG, None, None);

    let err = b.end_accept_channel(&token).expect_err("foreign token");
    assert!(matches!(
        err,
        TransportError::Usage(UsageError::ForeignToken { .. })
    ));
    assert!(a.end_accept_channel(&token).expect("owner").is_some());
}

#[test]
fn test_begin_accept_on_closed_listener_completes_synchronously() {
    let (_broker, listener) = open_listener();
    listener.close(LONG).expect("close");

    let token = listener.begin_accept_channel(LONG, None, None);
    assert!(token.completed_synchronously());
    assert!(listener.end_accept_channel(&token).expect("closed").is_none());
}

#[test]
fn test_empty_frame_is_ignored_by_listener() {
    let (broker, listener) = open_listener();
    let channel = listener
        .accept_channel(LONG)
        .expect("accept")
        .expect("channel");

    broker.publish_empty("orders");
    publish(&broker, "real", "x");

    let message = channel.receive(LONG).expect("receive").expect("message");
    assert_eq!(message.id, "real");
}

#[test]
fn test_raw_encoder_end_to_end() {
    init_tracing();
    let broker = InMemoryBroker::new();
    let listener = BrokerListener::new(
        ListenerConfig::local_broker("wharf://localhost:61616/topic/prices"),
        broker.clone(),
        RawEncoder::new(),
    );
    listener.open_default().expect("open");
    let channel = listener
        .accept_channel_default()
        .expect("accept")
        .expect("channel");

    broker.publish("prices", b"42.10".to_vec());
    let message = channel.receive(LONG).expect("receive").expect("message");
    assert_eq!(message.body, b"42.10");
    assert_eq!(message.id, "raw-1");
}

#[tokio::test]
async fn test_tokens_can_be_awaited() {
    let (broker, listener) = open_listener();
    let channel = listener
        .begin_accept_channel(LONG, None, None)
        .await
        .expect("accept")
        .expect("channel");

    let token = channel.begin_receive(LONG, None, None);
    publish(&broker, "awaited", "x");

    let message = token.await.expect("receive").expect("message");
    assert_eq!(message.id, "awaited");
}
