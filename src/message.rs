//! One-shot request helper: connect, send a payload, and collect the
//! reply until an expectation matches or the peer closes.
//!
//! The calling thread blocks on a rendezvous channel, so these
//! functions must not be called from a reactor's selector thread.

use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};

use crate::connection::{Conn, Connection};
use crate::error::Error;
use crate::handler::{ClientHandler, ConnectionHandler};
use crate::net::Address;
use crate::reactor::Reactor;

type Expected = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// `(collected input, close reason)`; input `None` means the connect
/// itself failed.
type Outcome = (Option<Vec<u8>>, Option<String>);

/// Sends `payload` to `addr` and returns everything received until the
/// peer closes the connection.
pub fn message<A, B>(reactor: &Reactor, addr: A, payload: B) -> Result<Vec<u8>, Error>
where
    A: Into<Address>,
    B: Into<Vec<u8>>,
{
    message_impl(reactor, addr.into(), payload.into(), None)
}

/// Like [`message`], but closes and returns as soon as `expected`
/// matches the input collected so far. A reply that ends without ever
/// matching fails with [`Error::UnexpectedResponse`].
pub fn message_expecting<A, B, F>(
    reactor: &Reactor,
    addr: A,
    payload: B,
    expected: F,
) -> Result<Vec<u8>, Error>
where
    A: Into<Address>,
    B: Into<Vec<u8>>,
    F: Fn(&[u8]) -> bool + Send + Sync + 'static,
{
    message_impl(reactor, addr.into(), payload.into(), Some(Arc::new(expected)))
}

fn message_impl(
    reactor: &Reactor,
    addr: Address,
    payload: Vec<u8>,
    expected: Option<Expected>,
) -> Result<Vec<u8>, Error> {
    let (notify, outcome) = bounded::<Outcome>(1);
    reactor.connect(
        addr,
        MessageClient {
            payload,
            expected: expected.clone(),
            notify,
        },
    );
    let (data, reason) = outcome.recv().map_err(|_| Error::Timeout)?;
    match (data, reason) {
        (Some(data), None) => Ok(data),
        (None, reason) => Err(Error::ConnectionFailed(
            reason.unwrap_or_else(|| "connection failed".to_string()),
        )),
        (Some(data), Some(_)) => match &expected {
            Some(expected) if !expected(&data) => Err(Error::UnexpectedResponse(data)),
            _ => Ok(data),
        },
    }
}

struct MessageClient {
    payload: Vec<u8>,
    expected: Option<Expected>,
    notify: Sender<Outcome>,
}

impl ClientHandler<Connection> for MessageClient {
    fn connected(&mut self, conn: Connection) {
        let _ = conn.write(self.payload.clone());
        let collector = Collector {
            input: Vec::new(),
            expected: self.expected.take(),
            notify: self.notify.clone(),
        };
        if conn.set_handler(collector).is_err() {
            conn.close();
        }
    }

    fn failed_connect(&mut self, reason: &str) {
        let _ = self.notify.try_send((None, Some(reason.to_string())));
    }
}

struct Collector {
    input: Vec<u8>,
    expected: Option<Expected>,
    notify: Sender<Outcome>,
}

impl ConnectionHandler<Connection> for Collector {
    fn handle_input(&mut self, conn: &Connection, data: &[u8]) {
        self.input.extend_from_slice(data);
        if let Some(expected) = &self.expected {
            if expected(&self.input) {
                conn.close();
                let _ = self.notify.try_send((Some(self.input.clone()), None));
            }
        }
    }

    fn handle_close(&mut self, _conn: &Connection, reason: &str) {
        let _ = self
            .notify
            .try_send((Some(std::mem::take(&mut self.input)), Some(reason.to_string())));
    }
}
