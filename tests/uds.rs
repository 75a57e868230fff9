use ngi::{Address, Conn, Connection, Reactor};

mod util;
use util::{client_probe, recv, ClientEv};

#[test]
fn unix_stream_round_trip_and_path_cleanup() {
    util::init();
    let path = util::temp_sock_path("stream");
    let reactor = Reactor::with_name("uds").unwrap();
    let listener = reactor
        .listen(path.as_path(), |conn: Connection| {
            conn.write(&b"over unix"[..]).unwrap();
            conn.close();
        })
        .unwrap();
    assert!(path.exists());

    let reply = ngi::message::message(&reactor, path.as_path(), Vec::new()).unwrap();
    assert_eq!(reply, b"over unix");

    listener.close();
    reactor.wait(Some(util::TIMEOUT)).unwrap();
    // The socket file is removed when the listener closes.
    assert!(!path.exists());
}

#[test]
fn unix_connect_to_missing_path_reports_errno_name() {
    util::init();
    let path = util::temp_sock_path("missing");
    let reactor = Reactor::with_name("uds-missing").unwrap();
    let (probe, outcomes) = client_probe::<Connection>();
    reactor.connect(path.as_path(), probe);

    match recv(&outcomes, "failed_connect") {
        ClientEv::Failed(reason) => assert_eq!(reason, "ENOENT"),
        ClientEv::Connected(_) => panic!("connected to a missing socket path"),
    }
    reactor.wait(Some(util::TIMEOUT)).unwrap();
}

#[test]
fn unix_datagram_round_trip() {
    util::init();
    let path = util::temp_sock_path("dgram");
    let reactor = Reactor::with_name("uds-dgram").unwrap();
    let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let listener = reactor
        .udp_listen(
            path.as_path(),
            move |_peer: &Address, data: &[u8]| {
                let _ = tx.send(data.to_vec());
            },
            4096,
        )
        .unwrap();

    reactor.udp_send(path.as_path(), b"dgram ping").unwrap();
    assert_eq!(recv(&rx, "datagram"), b"dgram ping".to_vec());

    listener.close();
    reactor.wait(Some(util::TIMEOUT)).unwrap();
    let _ = std::fs::remove_file(&path);
}
