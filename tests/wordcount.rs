//! A word-counting echo protocol exercised by many concurrent clients:
//! documents are sent terminated by `\0`, the server answers
//! `"<lines> <words> <chars>\n"` per document, and `"Q\0"` asks the
//! server to say goodbye and close.

use crossbeam_channel::Sender;
use ngi::{Address, ClientHandler, Conn, Connection, ConnectionHandler, Reactor};

mod util;

const CLIENTS: usize = 200;

const SAMPLE_DOCS: [&str; 4] = [
    "Hello world\n",
    "I give my pledge as an earthling\n\
     to save and faithfully to defend from waste\n\
     the natural resources of my planet\n\
     its soils, minerals, forests, waters and wildlife.\n",
    "On my honor, I will do my best\n\
     to do my duty to God and my country\n\
     and to obey the Scout Law\n\
     to always help others\n\
     to keep myself physically strong, mentally awake, and morally straight.\n",
    "What we have here, is a failure to communicate.\n",
];

fn counts_for(doc: &str) -> String {
    let lines = doc.matches('\n').count();
    let words = doc.split_whitespace().count();
    format!("{} {} {}\n", lines, words, doc.len())
}

struct WordCount {
    input: Vec<u8>,
}

impl ConnectionHandler<Connection> for WordCount {
    fn handle_input(&mut self, conn: &Connection, data: &[u8]) {
        self.input.extend_from_slice(data);
        while let Some(pos) = self.input.iter().position(|&byte| byte == 0) {
            let mut doc: Vec<u8> = self.input.drain(..=pos).collect();
            doc.pop();
            if doc == b"Q" {
                let _ = conn.write(&b"Q\n"[..]);
                conn.close();
                return;
            }
            let text = String::from_utf8_lossy(&doc);
            let _ = conn.write(counts_for(&text));
        }
    }
}

struct WcStarter {
    session: Option<WcSession>,
    done: Sender<Result<(), String>>,
}

impl ClientHandler<Connection> for WcStarter {
    fn connected(&mut self, conn: Connection) {
        if let Some(mut session) = self.session.take() {
            session.send_next(&conn);
            conn.set_handler(session).unwrap();
        }
    }

    fn failed_connect(&mut self, reason: &str) {
        let _ = self.done.send(Err(format!("failed to connect: {}", reason)));
    }
}

struct WcSession {
    next: usize,
    input: Vec<u8>,
    done: Sender<Result<(), String>>,
}

impl WcSession {
    fn send_next(&mut self, conn: &Connection) {
        let mut doc = SAMPLE_DOCS[self.next].as_bytes().to_vec();
        doc.push(0);
        let _ = conn.write(doc);
    }
}

impl ConnectionHandler<Connection> for WcSession {
    fn handle_input(&mut self, conn: &Connection, data: &[u8]) {
        self.input.extend_from_slice(data);
        while let Some(pos) = self.input.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.input.drain(..=pos).collect();
            let expected = counts_for(SAMPLE_DOCS[self.next]);
            if line != expected.as_bytes() {
                let _ = self.done.send(Err(format!(
                    "doc {}: got {:?}, expected {:?}",
                    self.next,
                    String::from_utf8_lossy(&line),
                    expected,
                )));
                conn.close();
                return;
            }
            self.next += 1;
            if self.next < SAMPLE_DOCS.len() {
                self.send_next(conn);
            } else {
                conn.close();
                let _ = self.done.send(Ok(()));
                return;
            }
        }
    }

    fn handle_close(&mut self, _conn: &Connection, reason: &str) {
        if self.next < SAMPLE_DOCS.len() {
            let _ = self
                .done
                .send(Err(format!("closed early after doc {}: {}", self.next, reason)));
        }
    }
}

#[test]
fn word_count_echo_under_concurrency() {
    util::init();
    let reactor = Reactor::with_name("wordcount").unwrap();
    let listener = reactor
        .listen(Address::local_any(), |conn: Connection| {
            conn.set_handler(WordCount { input: Vec::new() }).unwrap();
        })
        .unwrap();

    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    for _ in 0..CLIENTS {
        reactor.connect(
            listener.address(),
            WcStarter {
                session: Some(WcSession {
                    next: 0,
                    input: Vec::new(),
                    done: done_tx.clone(),
                }),
                done: done_tx.clone(),
            },
        );
    }
    drop(done_tx);

    for n in 0..CLIENTS {
        match done_rx.recv_timeout(std::time::Duration::from_secs(60)) {
            Ok(Ok(())) => {}
            Ok(Err(message)) => panic!("client failed: {}", message),
            Err(_) => panic!("timed out after {} of {} clients", n, CLIENTS),
        }
    }

    // A quit request is answered and closes that connection.
    let goodbye =
        ngi::message::message(&reactor, listener.address(), b"Q\0".to_vec()).unwrap();
    assert_eq!(goodbye, b"Q\n");

    listener.close();
    reactor.wait(Some(util::TIMEOUT)).unwrap();
}
