use ngi::adapters::{Lines, MessageHandler, Sized};
use ngi::testing::Connection;
use ngi::{Conn, Error};

mod util;
use util::{recorder, recv, Ev};

#[test]
fn lines_delivers_once_per_terminated_line() {
    util::init();
    let (wire, side) = Connection::pair();
    let _ = side;
    let lines = Lines::new(wire.clone());
    let (handler, events) = recorder();
    lines.set_handler(handler).unwrap();

    wire.test_input("first li");
    wire.test_input("ne\nsecond line\nfrag");

    assert_eq!(recv(&events, "line 1"), Ev::Input(b"first line".to_vec()));
    assert_eq!(recv(&events, "line 2"), Ev::Input(b"second line".to_vec()));
    // The unterminated fragment is never delivered on its own.
    assert!(events.try_recv().is_err());

    wire.test_input("ment\n");
    assert_eq!(recv(&events, "line 3"), Ev::Input(b"fragment".to_vec()));
}

#[test]
fn lines_passes_close_and_exception_through() {
    util::init();
    let (wire, _side) = Connection::pair();
    let lines = Lines::new(wire.clone());
    let (handler, events) = recorder();
    lines.set_handler(handler).unwrap();

    wire.test_input("partial");
    wire.test_exception(Error::Producer("stalled".to_string().into()));

    match recv(&events, "exception") {
        Ev::Exception(message) => assert!(message.contains("stalled"), "{}", message),
        other => panic!("expected exception, got {:?}", other),
    }
    match recv(&events, "close") {
        Ev::Close(reason) => assert!(reason.contains("stalled"), "{}", reason),
        other => panic!("expected close, got {:?}", other),
    }
}

#[test]
fn lines_writes_bypass_framing() {
    util::init();
    let (wire, side) = Connection::pair();
    let (handler, events) = recorder();
    side.set_handler(handler).unwrap();

    let lines = Lines::new(wire);
    lines.write(&b"raw bytes"[..]).unwrap();
    assert_eq!(recv(&events, "raw write"), Ev::Input(b"raw bytes".to_vec()));
    assert!(lines.is_open());
    lines.close();
    assert_eq!(recv(&events, "close"), Ev::Close("closed".to_string()));
}

/// Forwards received messages (`None` for a NULL) to a channel.
struct FrameProbe {
    tx: crossbeam_channel::Sender<Option<Vec<u8>>>,
}

impl<C> MessageHandler<C> for FrameProbe {
    fn handle_message(&mut self, _conn: &C, message: Option<&[u8]>) {
        let _ = self.tx.send(message.map(<[u8]>::to_vec));
    }
}

fn frame_probe() -> (FrameProbe, crossbeam_channel::Receiver<Option<Vec<u8>>>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (FrameProbe { tx }, rx)
}

#[test]
fn sized_round_trip_preserves_messages_and_nulls() {
    util::init();
    let (a, b) = Connection::pair();
    let sender = Sized::new(a);
    let receiver = Sized::new(b);
    let (handler, frames) = frame_probe();
    receiver.set_handler(handler).unwrap();

    let big = vec![b'x'; 70_000];
    let messages: Vec<Option<Vec<u8>>> = vec![
        Some(b"hi".to_vec()),
        Some(Vec::new()),
        Some(b"\x00\x01".to_vec()),
        None,
        Some(big.clone()),
    ];
    sender.writelines(messages.clone()).unwrap();

    for expected in messages {
        assert_eq!(recv(&frames, "frame"), expected);
    }
    assert!(frames.try_recv().is_err());
}

#[test]
fn sized_reassembles_from_dribbled_bytes() {
    util::init();
    let (wire, _side) = Connection::pair();
    let receiver = Sized::new(wire.clone());
    let (handler, frames) = frame_probe();
    receiver.set_handler(handler).unwrap();

    // Two frames and a NULL, fed one byte at a time.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&5u32.to_be_bytes());
    bytes.extend_from_slice(b"hello");
    bytes.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    bytes.extend_from_slice(&0u32.to_be_bytes());
    for byte in bytes {
        wire.test_input([byte].to_vec());
    }

    assert_eq!(recv(&frames, "frame 1"), Some(b"hello".to_vec()));
    assert_eq!(recv(&frames, "null"), None);
    assert_eq!(recv(&frames, "empty"), Some(Vec::new()));
}

#[test]
fn sized_write_emits_length_prefix() {
    util::init();
    let (wire, side) = Connection::pair();
    let (handler, events) = recorder();
    side.set_handler(handler).unwrap();

    let sender = Sized::new(wire);
    sender.write(b"abc").unwrap();
    assert_eq!(
        recv(&events, "framed write"),
        Ev::Input(b"\x00\x00\x00\x03abc".to_vec())
    );

    sender.write_null().unwrap();
    assert_eq!(
        recv(&events, "null write"),
        Ev::Input(b"\xff\xff\xff\xff".to_vec())
    );
}

#[test]
fn sized_close_passes_through() {
    util::init();
    let (wire, _side) = Connection::pair();
    let receiver = Sized::new(wire.clone());
    let (tx, rx) = crossbeam_channel::unbounded::<String>();
    struct CloseProbe {
        tx: crossbeam_channel::Sender<String>,
    }
    impl<C> MessageHandler<C> for CloseProbe {
        fn handle_message(&mut self, _conn: &C, _message: Option<&[u8]>) {}
        fn handle_close(&mut self, _conn: &C, reason: &str) {
            let _ = self.tx.send(reason.to_string());
        }
    }
    receiver.set_handler(CloseProbe { tx }).unwrap();

    wire.test_close("end of input");
    assert_eq!(recv(&rx, "close"), "end of input");
}
