// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::net::{SocketAddr, TcpStream};
use std::sync::Once;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use ngi::{ClientHandler, Conn, ConnectionHandler, Error};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

/// A local port with nothing listening on it, probed by connecting.
pub fn unused_port() -> u16 {
    use rand::Rng;
    let mut rng = rand::rng();
    for _ in 0..10 {
        let port = rng.random_range(20_000..30_000);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        if TcpStream::connect_timeout(&addr, Duration::from_millis(250)).is_err() {
            return port;
        }
    }
    panic!("cannot find an unused port");
}

/// A unique, short socket path under the system temp directory.
pub fn temp_sock_path(tag: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("ngi-{}-{}-{}.sock", tag, std::process::id(), n))
}

/// Events observed by a [`Recorder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ev {
    Input(Vec<u8>),
    Close(String),
    Exception(String),
}

/// A connection handler that forwards every event to a channel.
pub struct Recorder {
    tx: Sender<Ev>,
}

pub fn recorder() -> (Recorder, Receiver<Ev>) {
    let (tx, rx) = unbounded();
    (Recorder { tx }, rx)
}

impl<C: Conn> ConnectionHandler<C> for Recorder {
    fn handle_input(&mut self, _conn: &C, data: &[u8]) {
        let _ = self.tx.send(Ev::Input(data.to_vec()));
    }

    fn handle_close(&mut self, _conn: &C, reason: &str) {
        let _ = self.tx.send(Ev::Close(reason.to_string()));
    }

    fn handle_exception(&mut self, _conn: &C, error: Error) {
        let _ = self.tx.send(Ev::Exception(error.to_string()));
    }
}

/// Connect outcomes observed by a [`ClientProbe`].
pub enum ClientEv<C> {
    Connected(C),
    Failed(String),
}

/// A client handler that forwards its single outcome to a channel.
pub struct ClientProbe<C: Conn> {
    tx: Sender<ClientEv<C>>,
}

pub fn client_probe<C: Conn>() -> (ClientProbe<C>, Receiver<ClientEv<C>>) {
    let (tx, rx) = unbounded();
    (ClientProbe { tx }, rx)
}

impl<C: Conn> ClientHandler<C> for ClientProbe<C> {
    fn connected(&mut self, conn: C) {
        let _ = self.tx.send(ClientEv::Connected(conn));
    }

    fn failed_connect(&mut self, reason: &str) {
        let _ = self.tx.send(ClientEv::Failed(reason.to_string()));
    }
}

/// A client that binds a fresh [`Recorder`] inside `connected`, as the
/// handler contract asks, and hands back the connection paired with its
/// event stream.
pub struct RecordingClient<C: Conn> {
    tx: Sender<Result<(C, Receiver<Ev>), String>>,
}

pub fn recording_client<C: Conn>() -> (
    RecordingClient<C>,
    Receiver<Result<(C, Receiver<Ev>), String>>,
) {
    let (tx, rx) = unbounded();
    (RecordingClient { tx }, rx)
}

impl<C: Conn> ClientHandler<C> for RecordingClient<C> {
    fn connected(&mut self, conn: C) {
        let (handler, events) = recorder();
        conn.set_handler(handler).unwrap();
        let _ = self.tx.send(Ok((conn, events)));
    }

    fn failed_connect(&mut self, reason: &str) {
        let _ = self.tx.send(Err(reason.to_string()));
    }
}

/// Receives one event or panics with context after [`TIMEOUT`].
pub fn recv<T>(rx: &Receiver<T>, what: &str) -> T {
    rx.recv_timeout(TIMEOUT)
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}
