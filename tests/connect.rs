use std::time::Duration;

use crossbeam_channel::Receiver;
use ngi::{Address, Conn, Connection, Error, Reactor};

mod util;
use util::{client_probe, recorder, recv, unused_port, ClientEv, Ev};

/// Accumulates inputs until the close event arrives.
fn collect_until_close(events: &Receiver<Ev>) -> (Vec<u8>, String) {
    let mut input = Vec::new();
    loop {
        match recv(events, "input or close") {
            Ev::Input(data) => input.extend_from_slice(&data),
            Ev::Close(reason) => return (input, reason),
            Ev::Exception(message) => panic!("unexpected exception: {}", message),
        }
    }
}

#[test]
fn failed_connect_to_unused_port() {
    util::init();
    let reactor = Reactor::with_name("failed-connect").unwrap();
    let (probe, outcomes) = client_probe::<Connection>();
    reactor.connect(([127, 0, 0, 1], unused_port()), probe);

    match recv(&outcomes, "failed_connect") {
        ClientEv::Failed(reason) => assert!(!reason.is_empty()),
        ClientEv::Connected(_) => panic!("connect to an unused port succeeded"),
    }
    // Exactly one outcome, and the reactor drains afterwards.
    reactor.wait(Some(util::TIMEOUT)).unwrap();
    assert!(outcomes.try_recv().is_err());
}

#[test]
fn connect_and_receive() {
    util::init();
    let reactor = Reactor::with_name("connect-receive").unwrap();
    let listener = reactor
        .listen(Address::local_any(), |conn: Connection| {
            conn.write(&b"hi"[..]).unwrap();
            conn.close();
        })
        .unwrap();

    let reply = ngi::message::message(&reactor, listener.address(), Vec::new()).unwrap();
    assert_eq!(reply, b"hi");

    listener.close();
    reactor.wait(Some(util::TIMEOUT)).unwrap();
}

#[test]
fn half_close_preserves_ordering() {
    util::init();
    let reactor = Reactor::with_name("half-close").unwrap();
    let listener = reactor
        .listen(Address::local_any(), |conn: Connection| {
            conn.write(&b"a"[..]).unwrap();
            conn.write(&b"b"[..]).unwrap();
            conn.close();
        })
        .unwrap();

    let (client, sessions) = util::recording_client::<Connection>();
    reactor.connect(listener.address(), client);
    let (_conn, events) = recv(&sessions, "connected").expect("failed to connect");

    let (input, reason) = collect_until_close(&events);
    assert_eq!(input, b"ab");
    assert_eq!(reason, "end of input");

    listener.close();
    reactor.wait(Some(util::TIMEOUT)).unwrap();
}

#[test]
fn port_zero_binding_reports_real_port() {
    util::init();
    let reactor = Reactor::with_name("port-zero").unwrap();
    let listener = reactor
        .listen(Address::local_any(), |conn: Connection| {
            conn.write(&b"ok"[..]).unwrap();
            conn.close();
        })
        .unwrap();

    let port = listener.address().port().unwrap();
    assert!(port > 0);

    let reply = ngi::message::message(&reactor, listener.address(), Vec::new()).unwrap();
    assert_eq!(reply, b"ok");

    listener.close();
    reactor.wait(Some(util::TIMEOUT)).unwrap();
}

#[test]
fn reactor_lifecycle_starts_and_drains() {
    util::init();
    let reactor = Reactor::with_name("lifecycle").unwrap();
    assert!(!reactor.is_running());

    let listener = reactor
        .listen(Address::local_any(), |_conn: Connection| {})
        .unwrap();
    assert!(reactor.is_running());

    // A busy reactor outlives a short deadline.
    assert!(matches!(
        reactor.wait(Some(Duration::from_millis(200))),
        Err(Error::Timeout)
    ));

    listener.close();
    reactor.wait(Some(util::TIMEOUT)).unwrap();
    assert!(!reactor.is_running());
}

#[test]
fn inline_reactor_runs_in_calling_thread() {
    util::init();
    let reactor = Reactor::inline().unwrap();
    let (probe, outcomes) = client_probe::<Connection>();
    reactor.connect(([127, 0, 0, 1], unused_port()), probe);

    // Nothing happens until the caller drives the loop.
    assert!(outcomes.try_recv().is_err());
    reactor.wait(Some(util::TIMEOUT)).unwrap();

    match recv(&outcomes, "failed_connect") {
        ClientEv::Failed(reason) => assert!(!reason.is_empty()),
        ClientEv::Connected(_) => panic!("connect to an unused port succeeded"),
    }
}

#[test]
fn writelines_sends_in_order() {
    util::init();
    let reactor = Reactor::with_name("writelines").unwrap();
    let (server_tx, server_events) = crossbeam_channel::unbounded();
    let listener = reactor
        .listen(Address::local_any(), move |conn: Connection| {
            let (handler, events) = recorder();
            conn.set_handler(handler).unwrap();
            let _ = server_tx.send(events);
        })
        .unwrap();

    let (probe, outcomes) = client_probe::<Connection>();
    reactor.connect(listener.address(), probe);
    let conn = match recv(&outcomes, "connected") {
        ClientEv::Connected(conn) => conn,
        ClientEv::Failed(reason) => panic!("failed to connect: {}", reason),
    };
    let items: Vec<ngi::ProducerItem> = vec![Ok(b"wri".to_vec()), Ok(b"telines".to_vec())];
    conn.writelines(items).unwrap();
    conn.close();

    let events = recv(&server_events, "server side");
    let (input, reason) = collect_until_close(&events);
    assert_eq!(input, b"writelines");
    assert_eq!(reason, "end of input");

    listener.close();
    reactor.wait(Some(util::TIMEOUT)).unwrap();
}

#[test]
fn writelines_producer_error_closes_with_exception() {
    util::init();
    let reactor = Reactor::with_name("producer-error").unwrap();
    let listener = reactor
        .listen(Address::local_any(), |conn: Connection| {
            let (handler, _events) = recorder();
            conn.set_handler(handler).unwrap();
        })
        .unwrap();

    let (client, sessions) = util::recording_client::<Connection>();
    reactor.connect(listener.address(), client);
    let (conn, events) = recv(&sessions, "connected").expect("failed to connect");

    let items: Vec<ngi::ProducerItem> =
        vec![Ok(b"x".to_vec()), Err("boom".to_string().into())];
    conn.writelines(items).unwrap();

    match recv(&events, "exception") {
        Ev::Exception(message) => assert!(message.contains("boom"), "{}", message),
        other => panic!("expected exception, got {:?}", other),
    }
    match recv(&events, "close") {
        Ev::Close(reason) => assert!(reason.contains("boom"), "{}", reason),
        other => panic!("expected close, got {:?}", other),
    }
    assert!(!conn.is_open());

    listener.close();
    reactor.wait(Some(util::TIMEOUT)).unwrap();
}
