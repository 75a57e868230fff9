//! Event-driven, non-blocking network I/O with a uniform callback
//! contract for clients and servers.
//!
//! A [`Reactor`] is a single selector thread owning a set of
//! non-blocking endpoints. Applications obtain a [`Listener`],
//! an outbound connection via [`Reactor::connect`], or a
//! [`UdpListener`], and receive all events through handler callbacks
//! serialised on the selector thread: handlers never need locks of
//! their own. Writes go the other way through a thread-safe
//! [`Connection`] façade that queues output and nudges the selector.
//!
//! The [`adapters`] module layers line and length-prefixed framing over
//! any connection, and the [`testing`] module provides an in-process
//! transport honouring identical contracts, so protocol handlers can be
//! exercised without sockets.
//!
//! # Example
//!
//! An echo server on the process-wide default reactor:
//!
//! ```no_run
//! use ngi::{Address, Conn, Connection, ConnectionHandler};
//!
//! struct Echo;
//!
//! impl ConnectionHandler<Connection> for Echo {
//!     fn handle_input(&mut self, conn: &Connection, data: &[u8]) {
//!         let _ = conn.write(data);
//!     }
//! }
//!
//! fn main() -> Result<(), ngi::Error> {
//!     let listener = ngi::listen(Address::local_any(), |conn: Connection| {
//!         conn.set_handler(Echo).unwrap();
//!     })?;
//!     println!("echoing on {}", listener.address());
//!     ngi::wait(None)
//! }
//! ```

#![cfg(unix)]

mod connection;
mod connector;
mod error;
mod event;
mod handler;
mod interest;
mod listener;
mod net;
mod poll;
mod reactor;
mod sys;
mod token;
mod waker;

pub mod adapters;
pub mod message;
pub mod testing;

use std::time::Duration;

pub use crate::connection::{Conn, Connection};
pub use crate::error::{Error, ProducerError, ProducerItem};
pub use crate::handler::{ClientHandler, ConnectionHandler, DatagramHandler, ServerHandler};
pub use crate::listener::{Listener, UdpListener};
pub use crate::net::Address;
pub use crate::reactor::{global, Reactor};

/// [`Reactor::connect`] on the process-wide default reactor.
pub fn connect<A, H>(addr: A, handler: H)
where
    A: Into<Address>,
    H: ClientHandler<Connection> + 'static,
{
    global().connect(addr, handler)
}

/// [`Reactor::listen`] on the process-wide default reactor.
pub fn listen<A, H>(addr: A, handler: H) -> Result<Listener, Error>
where
    A: Into<Address>,
    H: ServerHandler<Connection> + 'static,
{
    global().listen(addr, handler)
}

/// [`Reactor::listen_per_client`] on the process-wide default reactor.
pub fn listen_per_client<A, H>(addr: A, handler: H) -> Result<Listener, Error>
where
    A: Into<Address>,
    H: ServerHandler<Connection> + 'static,
{
    global().listen_per_client(addr, handler)
}

/// [`Reactor::udp_listen`] on the process-wide default reactor.
pub fn udp_listen<A, H>(addr: A, handler: H, buffer_size: usize) -> Result<UdpListener, Error>
where
    A: Into<Address>,
    H: DatagramHandler + 'static,
{
    global().udp_listen(addr, handler, buffer_size)
}

/// [`Reactor::udp_send`] on the process-wide default reactor.
pub fn udp_send<A, B>(addr: A, data: B) -> Result<(), Error>
where
    A: Into<Address>,
    B: AsRef<[u8]>,
{
    global().udp_send(addr, data)
}

/// [`Reactor::post`] on the process-wide default reactor.
pub fn post<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    global().post(f)
}

/// [`Reactor::wait`] on the process-wide default reactor.
pub fn wait(timeout: Option<Duration>) -> Result<(), Error> {
    global().wait(timeout)
}
