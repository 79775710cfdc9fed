// Lifecycle: counted init/term, bounded drain, stalled teardown, and resource release.
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use ulink::api::{
    AttributeCodec, Encoding, Error, ErrorKind, Listener, Payload, Phase, PutOptions, TlvCodec,
    TransportConfig, UMessage, UTransport, UUri,
};
use ulink::local::{Fault, LocalSession};

fn door() -> UUri {
    UUri::topic("body", 1, "door", Some("front_left"), Some("Door"))
}

fn quiet() -> Arc<dyn Listener> {
    Arc::new(|_message: UMessage| -> Result<(), Error> { Ok(()) })
}

fn running_with(drain_timeout_ms: u64) -> UTransport<LocalSession> {
    let mut config = TransportConfig::default();
    config.drain_timeout_ms = drain_timeout_ms;
    let transport = UTransport::builder(LocalSession::new())
        .config(config)
        .build()
        .expect("transport");
    transport.init().expect("init");
    transport
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Starts one publish per topic, each staying inside the substrate `put` for `delay`.
fn slow_sends(
    transport: &UTransport<LocalSession>,
    delay: Duration,
    topics: Vec<UUri>,
) -> Vec<thread::JoinHandle<Result<(), Error>>> {
    transport.session().set_put_delay(delay);
    let count = topics.len();
    let handles = topics
        .into_iter()
        .map(|topic| {
            let sender = transport.clone();
            thread::spawn(move || sender.send(&UMessage::publish(topic, Payload::borrowed(b"slow"))))
        })
        .collect();
    wait_until(|| transport.stats().publishers == count);
    handles
}

fn slow_send(
    transport: &UTransport<LocalSession>,
    delay: Duration,
) -> thread::JoinHandle<Result<(), Error>> {
    let mut handles = slow_sends(transport, delay, vec![door()]);
    handles.remove(0)
}

#[test]
fn term_waits_for_in_flight_sends() {
    let transport = running_with(5_000);
    transport
        .register_listener(&door(), quiet())
        .expect("register");
    let sender = slow_send(&transport, Duration::from_millis(150));

    transport.term().expect("term");
    sender.join().expect("join").expect("in-flight send completes");

    let stats = transport.stats();
    assert_eq!(stats.phase, Phase::Closed);
    assert_eq!(stats.publishers, 0);
    assert_eq!(stats.listeners, 0);
    assert_eq!(stats.in_flight, 0);
    assert!(!transport.session().is_open());

    let err = transport
        .send(&UMessage::publish(door(), Payload::empty()))
        .expect_err("after term");
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    let err = transport
        .register_listener(&door(), quiet())
        .expect_err("after term");
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

#[test]
fn term_waits_for_every_concurrent_send() {
    let transport = running_with(5_000);
    let topics: Vec<UUri> = ["front_left", "front_right", "rear_left", "rear_right"]
        .into_iter()
        .map(|instance| UUri::topic("body", 1, "door", Some(instance), None))
        .collect();
    let senders = slow_sends(&transport, Duration::from_millis(150), topics);
    assert_eq!(transport.stats().in_flight, 4);

    transport.term().expect("term");
    for sender in senders {
        sender.join().expect("join").expect("in-flight send completes");
    }
    let stats = transport.stats();
    assert_eq!(stats.phase, Phase::Closed);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.publishers, 0);
    let local = transport.session().stats();
    assert_eq!(local.puts, 4);
    assert_eq!(local.live_publishers, 0);
}

#[test]
fn stats_do_not_wait_for_teardown() {
    let transport = running_with(5_000);
    let sender = slow_send(&transport, Duration::from_millis(500));
    let terminator = {
        let transport = transport.clone();
        thread::spawn(move || transport.term())
    };

    wait_until(|| transport.stats().terminating);
    assert_eq!(transport.stats().phase, Phase::Stalled);

    terminator.join().expect("join").expect("term");
    sender.join().expect("join").expect("slow send");
    assert_eq!(transport.stats().phase, Phase::Closed);
}

#[test]
fn terminating_transport_discards_publications() {
    let transport = running_with(30);
    let (tx, received) = mpsc::channel();
    let listener: Arc<dyn Listener> = Arc::new(move |message: UMessage| -> Result<(), Error> {
        let _ = tx.send(message);
        Ok(())
    });
    transport
        .register_listener(&door(), listener)
        .expect("register");

    let sender = slow_send(&transport, Duration::from_millis(300));
    transport.term().expect_err("drain timeout");
    assert!(transport.stats().terminating);
    sender.join().expect("join").expect("slow send");
    assert!(received.recv_timeout(Duration::from_millis(100)).is_err());

    transport.term().expect("retry");
}

#[test]
fn drain_timeout_stalls_and_term_retries() {
    let transport = running_with(30);
    let sender = slow_send(&transport, Duration::from_millis(300));

    let err = transport.term().expect_err("drain timeout");
    assert_eq!(err.kind(), ErrorKind::Internal);
    let stats = transport.stats();
    assert_eq!(stats.phase, Phase::Stalled);
    assert_eq!(stats.users, 0);
    assert!(stats.terminating);
    assert!(transport.session().is_open());

    let err = transport
        .send(&UMessage::publish(door(), Payload::empty()))
        .expect_err("terminating");
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    sender.join().expect("join").expect("slow send");
    transport.term().expect("retry");
    assert_eq!(transport.stats().phase, Phase::Closed);
    assert_eq!(transport.session().stats().live_publishers, 0);
}

#[test]
fn init_resumes_stalled_transport() {
    let transport = running_with(30);
    let sender = slow_send(&transport, Duration::from_millis(300));
    transport.term().expect_err("drain timeout");
    sender.join().expect("join").expect("slow send");

    transport.session().set_put_delay(Duration::ZERO);
    transport.init().expect("resume");
    let stats = transport.stats();
    assert_eq!(stats.phase, Phase::Running);
    assert_eq!(stats.users, 1);
    assert!(!stats.terminating);
    transport
        .send(&UMessage::publish(door(), Payload::empty()))
        .expect("send after resume");
    assert_eq!(transport.session().stats().publishers_declared, 1);

    transport.term().expect("term");
    assert_eq!(transport.stats().phase, Phase::Closed);
}

#[test]
fn undeclare_failure_aborts_teardown() {
    let transport = running_with(1_000);
    transport
        .register_listener(&door(), quiet())
        .expect("register");
    transport
        .send(&UMessage::publish(door(), Payload::empty()))
        .expect("send");

    transport.session().inject(Fault::Undeclare);
    let err = transport.term().expect_err("undeclare fault");
    assert_eq!(err.kind(), ErrorKind::Internal);
    let stats = transport.stats();
    assert_eq!(stats.phase, Phase::Stalled);
    assert_eq!(stats.publishers, 1);
    assert_eq!(stats.listeners, 1);
    assert_eq!(transport.session().stats().live_publishers, 1);
    assert!(transport.session().is_open());

    transport.term().expect("retry");
    let local = transport.session().stats();
    assert_eq!(local.live_publishers, 0);
    assert_eq!(local.live_subscribers, 0);
    assert_eq!(transport.stats().publishers, 0);
    assert_eq!(transport.stats().listeners, 0);
    assert!(!transport.session().is_open());
}

#[test]
fn close_failure_leaves_transport_stalled() {
    let transport = running_with(1_000);
    transport.session().inject(Fault::Close);
    transport.term().expect_err("close fault");
    assert_eq!(transport.stats().phase, Phase::Stalled);
    transport.term().expect("retry");
    assert_eq!(transport.stats().phase, Phase::Closed);
}

#[test]
fn teardown_releases_listener_contexts() {
    let transport = running_with(1_000);
    let listener = quiet();
    let rpc = UUri::rpc_method("body", 1, "Lock");
    transport
        .register_listener(&door(), Arc::clone(&listener))
        .expect("register");
    transport
        .register_listener(&rpc, Arc::clone(&listener))
        .expect("register");
    assert_eq!(Arc::strong_count(&listener), 5);

    transport.term().expect("term");
    assert_eq!(Arc::strong_count(&listener), 1);
}

#[test]
fn teardown_drops_unanswered_requests() {
    let transport = running_with(1_000);
    let method = UUri::rpc_method("body", 1, "Lock");
    transport
        .register_listener(&method, quiet())
        .expect("register");

    let request = UMessage::request(UUri::rpc_response("client", 1), method.clone(), Payload::empty());
    let header = TlvCodec.encode(&request.attributes).expect("encode");
    let key = transport.resolve(&method).expect("key");
    let replies = transport
        .session()
        .get(&key, b"", PutOptions::with_header(Encoding::TextPlain, header))
        .expect("get");
    wait_until(|| transport.stats().pending_requests == 1);

    transport.term().expect("term");
    assert_eq!(transport.stats().pending_requests, 0);
    assert!(replies.recv_timeout(Duration::from_secs(5)).is_err());
}

#[test]
fn clones_share_one_lifecycle() {
    let transport = UTransport::new(LocalSession::new()).expect("transport");
    let other = transport.clone();
    transport.init().expect("init");
    other.init().expect("init");
    assert_eq!(transport.stats().users, 2);

    other.term().expect("term");
    transport
        .send(&UMessage::publish(door(), Payload::empty()))
        .expect("still running");
    transport.term().expect("term");
    assert_eq!(other.stats().phase, Phase::Closed);
}
