use ngi::testing::{self, Connection};
use ngi::{Address, Conn, Error};

mod util;
use util::{client_probe, recorder, recv, ClientEv, Ev};

fn test_addr(port: u16) -> Address {
    Address::from(([127, 0, 0, 1], port))
}

#[test]
fn events_before_handler_are_replayed_in_order() {
    util::init();
    let (a, b) = Connection::pair();
    let _ = a;

    b.test_input("hel");
    b.test_input("lo");
    b.test_close("end of input");

    let (handler, events) = recorder();
    b.set_handler(handler).unwrap();

    // Consecutive inputs coalesce, as a socket read would.
    assert_eq!(recv(&events, "input"), Ev::Input(b"hello".to_vec()));
    assert_eq!(
        recv(&events, "close"),
        Ev::Close("end of input".to_string())
    );
    assert!(!b.is_open());
}

#[test]
fn write_reaches_peer_and_close_is_seen() {
    util::init();
    let (a, b) = Connection::pair();
    let (handler, events) = recorder();
    b.set_handler(handler).unwrap();

    a.write(&b"ab"[..]).unwrap();
    a.close();

    assert_eq!(recv(&events, "input"), Ev::Input(b"ab".to_vec()));
    assert_eq!(recv(&events, "close"), Ev::Close("closed".to_string()));

    // The closed side no longer accepts writes.
    assert!(matches!(a.write(&b"x"[..]), Err(Error::Closed)));
    assert!(!a.is_open());
}

#[test]
fn set_handler_twice_fails() {
    util::init();
    let (a, _b) = Connection::pair();
    let (handler, _events) = recorder();
    a.set_handler(handler).unwrap();
    let (handler, _events) = recorder();
    assert!(matches!(
        a.set_handler(handler),
        Err(Error::HandlerAlreadySet)
    ));
}

#[test]
fn connect_without_server_fails_once() {
    util::init();
    let (probe, outcomes) = client_probe::<Connection>();
    testing::connect(test_addr(4000), probe);
    match recv(&outcomes, "failed_connect") {
        ClientEv::Failed(reason) => assert_eq!(reason, "no such server"),
        ClientEv::Connected(_) => panic!("unexpected connect"),
    }
    assert!(outcomes.try_recv().is_err());
}

#[test]
fn listener_dispatches_connects() {
    util::init();
    let addr = test_addr(4001);
    let listener = testing::listener(addr.clone(), |conn: Connection| {
        let (handler, _events) = recorder();
        conn.set_handler(handler).unwrap();
        conn.write(&b"welcome\n"[..]).unwrap();
    });

    let (probe, outcomes) = client_probe::<Connection>();
    testing::connect(addr.clone(), probe);
    let conn = match recv(&outcomes, "connected") {
        ClientEv::Connected(conn) => conn,
        ClientEv::Failed(reason) => panic!("failed to connect: {}", reason),
    };
    assert_eq!(conn.peer_address(), addr);

    let (handler, events) = recorder();
    conn.set_handler(handler).unwrap();
    assert_eq!(recv(&events, "input"), Ev::Input(b"welcome\n".to_vec()));

    assert_eq!(listener.connections().len(), 1);
    listener.close();
    assert_eq!(recv(&events, "close"), Ev::Close("closed".to_string()));
    assert!(listener.connections().is_empty());
}

#[test]
fn listener_close_notify_fires_after_last_child() {
    util::init();
    let addr = test_addr(4002);
    let listener = testing::listener(addr.clone(), |conn: Connection| {
        let (handler, _events) = recorder();
        conn.set_handler(handler).unwrap();
    });

    let (probe, outcomes) = client_probe::<Connection>();
    testing::connect(addr.clone(), probe);
    let conn = match recv(&outcomes, "connected") {
        ClientEv::Connected(conn) => conn,
        ClientEv::Failed(reason) => panic!("failed to connect: {}", reason),
    };

    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
    listener.close_notify(move |_| {
        let _ = done_tx.send(());
    });
    assert!(done_rx.try_recv().is_err());

    conn.close();
    recv(&done_rx, "close notification");
}

#[test]
fn writelines_producer_error_is_delivered_then_closes() {
    util::init();
    let (a, _b) = Connection::pair();
    let (handler, events) = recorder();
    a.set_handler(handler).unwrap();

    let items: Vec<ngi::ProducerItem> = vec![
        Ok(b"one".to_vec()),
        Err("boom".to_string().into()),
        Ok(b"never".to_vec()),
    ];
    a.writelines(items).unwrap();

    match recv(&events, "exception") {
        Ev::Exception(message) => assert!(message.contains("boom"), "{}", message),
        other => panic!("expected exception, got {:?}", other),
    }
    match recv(&events, "close") {
        Ev::Close(reason) => assert!(reason.contains("boom"), "{}", reason),
        other => panic!("expected close, got {:?}", other),
    }
    assert!(!a.is_open());
}

#[test]
fn udp_emulation_truncates_to_buffer_size() {
    util::init();
    let addr = test_addr(4003);
    let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let listener = testing::udp_listener(
        addr.clone(),
        move |_peer: &Address, data: &[u8]| {
            let _ = tx.send(data.to_vec());
        },
        8,
    );

    testing::udp(addr.clone(), b"0123456789abcdef");
    assert_eq!(recv(&rx, "datagram"), b"01234567".to_vec());

    listener.close();
    testing::udp(addr, b"dropped");
    assert!(rx.try_recv().is_err());
}
