//! Application-facing callback contracts.
//!
//! All callbacks for a given connection run on its reactor's selector
//! thread, strictly serialised, so handlers need no internal locking.
//! Handlers are generic over the connection type: the same handler runs
//! unchanged against the socket transport ([`Connection`]) and the
//! in-process testing transport ([`testing::Connection`]).
//!
//! [`Connection`]: crate::Connection
//! [`testing::Connection`]: crate::testing::Connection

use log::warn;

use crate::connection::Conn;
use crate::error::Error;
use crate::net::Address;

/// Receives events for one established connection.
///
/// The close and exception callbacks are capability variants: a handler
/// that cares only about input keeps the default no-ops. At most one
/// `handle_close` is ever delivered, and nothing follows it.
pub trait ConnectionHandler<C: Conn>: Send {
    /// Called with each chunk of bytes read from the peer.
    fn handle_input(&mut self, conn: &C, data: &[u8]);

    /// Called once when the connection ends: peer close (`"end of
    /// input"`), a fatal socket error, or a forced close with a
    /// descriptive reason.
    fn handle_close(&mut self, conn: &C, reason: &str) {
        let _ = (conn, reason);
    }

    /// Called when a `writelines` producer fails. The connection closes
    /// right after this returns.
    fn handle_exception(&mut self, conn: &C, error: Error) {
        let _ = conn;
        warn!("unhandled connection exception: {}", error);
    }
}

/// Receives the outcome of an outbound connect. Exactly one of the two
/// callbacks is invoked, exactly once.
pub trait ClientHandler<C: Conn>: Send {
    fn connected(&mut self, conn: C);

    /// `reason` is the errno name (e.g. `"ECONNREFUSED"`) when one is
    /// known, or the OS error string otherwise.
    fn failed_connect(&mut self, reason: &str);
}

/// Accepts inbound connections from a listener.
pub trait ServerHandler<C: Conn>: Send {
    fn handle_connection(&mut self, conn: C);
}

impl<C: Conn, F> ServerHandler<C> for F
where
    F: FnMut(C) + Send,
{
    fn handle_connection(&mut self, conn: C) {
        self(conn)
    }
}

/// Receives datagrams from a UDP listener.
pub trait DatagramHandler: Send {
    fn handle_datagram(&mut self, peer: &Address, data: &[u8]);
}

impl<F> DatagramHandler for F
where
    F: FnMut(&Address, &[u8]) + Send,
{
    fn handle_datagram(&mut self, peer: &Address, data: &[u8]) {
        self(peer, data)
    }
}
