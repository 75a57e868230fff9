use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, trace};
use parking_lot::Mutex;

use crate::error::{Error, ProducerItem};
use crate::event::Event;
use crate::handler::ConnectionHandler;
use crate::interest::Interest;
use crate::listener::ListenerInner;
use crate::net::{Address, StreamSocket};
use crate::poll::Registration;
use crate::reactor::{Core, Endpoint};
use crate::token::Token;

/// Size of a single read from the socket.
const BUFFER_SIZE: usize = 8 * 1024;

/// Soft limit on bytes coalesced into one send call.
const SEND_SIZE: usize = 60_000;

/// The connection contract.
///
/// Implemented by the socket-backed [`Connection`], the in-process
/// [`testing::Connection`] and the [`Lines`] adapter, so application
/// handlers written against a generic `C: Conn` run unchanged over any
/// of them.
///
/// All methods may be called from any thread, except `set_handler`
/// which must be called in direct response to a `connected`, server
/// handler, or handler callback (and therefore runs on the selector
/// thread of the connection's reactor).
///
/// [`testing::Connection`]: crate::testing::Connection
/// [`Lines`]: crate::adapters::Lines
pub trait Conn: Clone + Send + Sync + Sized + 'static {
    /// Binds the handler that receives this connection's events.
    ///
    /// Events that arrived before the handler was bound are replayed in
    /// order: a deferred producer exception first, then a deferred
    /// close. Binding twice fails with [`Error::HandlerAlreadySet`].
    fn set_handler<H>(&self, handler: H) -> Result<(), Error>
    where
        H: ConnectionHandler<Self> + 'static;

    /// Queues `data` for transmission. Output is sent in append order.
    fn write<B>(&self, data: B) -> Result<(), Error>
    where
        B: Into<Vec<u8>>;

    /// Queues a lazy producer of buffers. The producer is advanced on
    /// the selector thread as the socket accepts output; an `Err` item
    /// is routed to `handle_exception` and then closes the connection.
    fn writelines<I>(&self, items: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = ProducerItem>,
        I::IntoIter: Send + 'static;

    /// Closes the connection once all previously queued output has been
    /// sent. Idempotent.
    fn close(&self);

    /// The peer's address.
    fn peer_address(&self) -> Address;

    /// Whether the connection still accepts writes.
    fn is_open(&self) -> bool;
}

enum OutputItem {
    Data(Vec<u8>),
    Producer(Box<dyn Iterator<Item = ProducerItem> + Send>),
    EndOfData,
}

struct Output {
    queue: VecDeque<OutputItem>,
    open: bool,
}

struct ConnState {
    socket: Option<StreamSocket>,
    handler: Option<Box<dyn ConnectionHandler<Connection>>>,
    deferred_error: Option<Error>,
    deferred_close: Option<String>,
    closed: bool,
}

/// One bidirectional byte stream owned by a reactor.
///
/// Handles are cheap clones of shared state; the reactor keeps one in
/// its endpoint map until the connection closes.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    core: Arc<Core>,
    token: Token,
    peer_addr: Address,
    handler_bound: AtomicBool,
    closed: AtomicBool,
    state: Mutex<ConnState>,
    output: Mutex<Output>,
    registration: Mutex<Option<Registration>>,
    listener: Option<Weak<ListenerInner>>,
}

impl Connection {
    /// Wraps an established non-blocking stream and registers it with
    /// `core`'s endpoint map. No selector interest is requested until a
    /// handler is bound or output is queued.
    pub(crate) fn register(
        core: &Arc<Core>,
        socket: StreamSocket,
        peer_addr: Address,
        listener: Option<Weak<ListenerInner>>,
    ) -> Connection {
        let token = core.next_token();
        let registration = Registration::new(core.registry().clone(), token, socket.as_raw_fd());
        let conn = Connection {
            inner: Arc::new(ConnInner {
                core: core.clone(),
                token,
                peer_addr,
                handler_bound: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                state: Mutex::new(ConnState {
                    socket: Some(socket),
                    handler: None,
                    deferred_error: None,
                    deferred_close: None,
                    closed: false,
                }),
                output: Mutex::new(Output {
                    queue: VecDeque::new(),
                    open: true,
                }),
                registration: Mutex::new(Some(registration)),
                listener,
            }),
        };
        core.insert_endpoint(token, Endpoint::Conn(conn.clone()));
        conn
    }

    pub(crate) fn same_connection(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Closes immediately with a terminal `handle_close(reason)`,
    /// discarding queued output. Selector thread only.
    pub(crate) fn force_close(&self, reason: &str) {
        let mut st = self.inner.state.lock();
        self.terminate(&mut st, Some(reason));
    }

    /// Recomputes the wanted selector interest from connection state
    /// and applies it. Never called with the state lock's owner being
    /// another thread's handler dispatch, so a brief stale view only
    /// lasts until the next state transition.
    fn update_interest(&self) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let writable = {
            let out = inner.output.lock();
            out.open && !out.queue.is_empty()
        };
        let readable = inner.handler_bound.load(Ordering::Acquire);
        let want = Interest::from_wants(readable, writable);
        if let Some(reg) = inner.registration.lock().as_mut() {
            if let Err(err) = reg.ensure(want) {
                debug!("{}: failed to update interest: {}", inner.peer_addr, err);
            }
        }
    }

    pub(crate) fn dispatch_event(&self, event: &Event) {
        if event.is_readable() || event.is_read_closed() {
            self.dispatch_read();
        }
        if event.is_writable() {
            self.dispatch_write();
        }
        if event.is_error()
            && !(event.is_readable() || event.is_read_closed() || event.is_writable())
        {
            self.dispatch_error();
        }
    }

    /// Read readiness: pull up to `BUFFER_SIZE` at a time and hand each
    /// chunk to the handler, until a short read or a transient error. A
    /// zero-length read is the peer's close.
    fn dispatch_read(&self) {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.closed || st.handler.is_none() {
            return;
        }
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            let n = {
                let socket = match st.socket.as_mut() {
                    Some(socket) => socket,
                    None => return,
                };
                match socket.read(&mut buf) {
                    Ok(n) => n,
                    Err(ref err) if expected_io_error(err) => return,
                    Err(err) => {
                        let reason = err.to_string();
                        trace!("{}: read error: {}", inner.peer_addr, reason);
                        self.terminate(&mut st, Some(&reason));
                        return;
                    }
                }
            };
            if n == 0 {
                self.terminate(&mut st, Some("end of input"));
                return;
            }
            trace!("{}: input {} bytes", inner.peer_addr, n);
            let faulted = {
                let handler = match st.handler.as_mut() {
                    Some(handler) => handler,
                    None => return,
                };
                panic::catch_unwind(AssertUnwindSafe(|| handler.handle_input(self, &buf[..n])))
                    .err()
            };
            if let Some(payload) = faulted {
                error!("{}: handle_input failed", inner.peer_addr);
                self.terminate(&mut st, Some("handle_input failed"));
                drop(st);
                panic::resume_unwind(payload);
            }
            if n < BUFFER_SIZE {
                return;
            }
        }
    }

    /// Write readiness: drain the output queue, coalescing buffers up
    /// to `SEND_SIZE` per send and advancing producers one element at a
    /// time. A partial send puts the unsent tail back at the head of
    /// the queue; END-OF-DATA closes the connection once everything
    /// before it went out.
    fn dispatch_write(&self) {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.closed || st.socket.is_none() {
            return;
        }
        let mut out = inner.output.lock();
        let mut tosend: Vec<u8> = Vec::new();
        let mut send_size = SEND_SIZE;
        loop {
            let front = match out.queue.front_mut() {
                Some(front) => front,
                None => break,
            };
            match front {
                OutputItem::EndOfData => {
                    if tosend.is_empty() {
                        drop(out);
                        trace!("{}: output drained, closing", inner.peer_addr);
                        self.terminate(&mut st, None);
                        return;
                    }
                    // Flush what has accumulated, then close next pass.
                    send_size = 0;
                }
                OutputItem::Data(_) => {
                    if let Some(OutputItem::Data(data)) = out.queue.pop_front() {
                        tosend.extend_from_slice(&data);
                    }
                }
                OutputItem::Producer(producer) => match producer.next() {
                    None => {
                        out.queue.pop_front();
                    }
                    Some(Ok(chunk)) => tosend.extend_from_slice(&chunk),
                    Some(Err(err)) => {
                        error!("{}: writelines producer failed: {}", inner.peer_addr, err);
                        let error = Error::Producer(err);
                        let reason = error.to_string();
                        drop(out);
                        let faulted = match st.handler.as_mut() {
                            Some(handler) => panic::catch_unwind(AssertUnwindSafe(|| {
                                handler.handle_exception(self, error)
                            }))
                            .err(),
                            None => {
                                st.deferred_error = Some(error);
                                None
                            }
                        };
                        if let Some(payload) = faulted {
                            error!("{}: handle_exception failed", inner.peer_addr);
                            self.terminate(&mut st, Some("handle_exception failed"));
                            drop(st);
                            panic::resume_unwind(payload);
                        }
                        self.terminate(&mut st, Some(&reason));
                        return;
                    }
                },
            }
            if !out.queue.is_empty() && tosend.len() < send_size {
                continue;
            }
            if tosend.is_empty() {
                continue;
            }
            let socket = match st.socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            match socket.write(&tosend) {
                Ok(n) if n == tosend.len() => {
                    trace!("{}: sent {} bytes", inner.peer_addr, n);
                    tosend.clear();
                }
                Ok(n) => {
                    trace!("{}: partial send {} of {} bytes", inner.peer_addr, n, tosend.len());
                    let rest = tosend.split_off(n);
                    out.queue.push_front(OutputItem::Data(rest));
                    break;
                }
                Err(ref err) if expected_write_error(err) => {
                    out.queue.push_front(OutputItem::Data(std::mem::take(&mut tosend)));
                    break;
                }
                Err(err) => {
                    let reason = err.to_string();
                    trace!("{}: send error: {}", inner.peer_addr, reason);
                    drop(out);
                    self.terminate(&mut st, Some(&reason));
                    return;
                }
            }
        }
        drop(out);
        drop(st);
        self.update_interest();
    }

    fn dispatch_error(&self) {
        let mut st = self.inner.state.lock();
        self.terminate(&mut st, Some("socket error"));
    }

    /// Transitions to closed exactly once. With a `reason` the terminal
    /// `handle_close` is delivered (or recorded for replay when no
    /// handler is bound); without one the close is silent, as for a
    /// locally requested close whose output has drained.
    fn terminate(&self, st: &mut ConnState, reason: Option<&str>) {
        let inner = &self.inner;
        if st.closed {
            return;
        }
        st.closed = true;
        inner.closed.store(true, Ordering::Release);
        {
            let mut out = inner.output.lock();
            out.open = false;
            out.queue.clear();
        }
        if let Some(reason) = reason {
            debug!("{}: close: {}", inner.peer_addr, reason);
            match st.handler.as_mut() {
                Some(handler) => {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        handler.handle_close(self, reason)
                    }));
                    if result.is_err() {
                        error!("{}: handle_close({:?}) failed", inner.peer_addr, reason);
                    }
                }
                None => st.deferred_close = Some(reason.to_string()),
            }
        }
        *inner.registration.lock() = None;
        st.socket = None;
        if let Some(listener) = inner.listener.as_ref().and_then(Weak::upgrade) {
            listener.child_closed(self);
        }
        inner.core.remove_endpoint(inner.token);
    }
}

impl Conn for Connection {
    fn set_handler<H>(&self, handler: H) -> Result<(), Error>
    where
        H: ConnectionHandler<Self> + 'static,
    {
        let inner = &self.inner;
        let mut st = match inner.state.try_lock() {
            Some(st) => st,
            // The state lock is held across handler dispatch, so a
            // failed try_lock here is a reentrant bind from this
            // connection's own callback.
            None => return Err(Error::HandlerAlreadySet),
        };
        if inner.handler_bound.swap(true, Ordering::AcqRel) {
            return Err(Error::HandlerAlreadySet);
        }
        let mut handler: Box<dyn ConnectionHandler<Connection>> = Box::new(handler);
        if let Some(error) = st.deferred_error.take() {
            handler.handle_exception(self, error);
        }
        if let Some(reason) = st.deferred_close.take() {
            handler.handle_close(self, &reason);
        }
        st.handler = Some(handler);
        drop(st);
        self.update_interest();
        Ok(())
    }

    fn write<B>(&self, data: B) -> Result<(), Error>
    where
        B: Into<Vec<u8>>,
    {
        let data = data.into();
        {
            let mut out = self.inner.output.lock();
            if !out.open {
                return Err(Error::Closed);
            }
            trace!("{}: queueing {} bytes", self.inner.peer_addr, data.len());
            out.queue.push_back(OutputItem::Data(data));
        }
        self.update_interest();
        Ok(())
    }

    fn writelines<I>(&self, items: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = ProducerItem>,
        I::IntoIter: Send + 'static,
    {
        {
            let mut out = self.inner.output.lock();
            if !out.open {
                return Err(Error::Closed);
            }
            out.queue
                .push_back(OutputItem::Producer(Box::new(items.into_iter())));
        }
        self.update_interest();
        Ok(())
    }

    fn close(&self) {
        {
            let mut out = self.inner.output.lock();
            if !out.open {
                return;
            }
            out.queue.push_back(OutputItem::EndOfData);
        }
        self.update_interest();
    }

    fn peer_address(&self) -> Address {
        self.inner.peer_addr.clone()
    }

    fn is_open(&self) -> bool {
        self.inner.output.lock().open
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Connection")
            .field("peer", &self.inner.peer_addr)
            .field("token", &self.inner.token)
            .field("open", &self.is_open())
            .finish()
    }
}

fn expected_io_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn expected_write_error(err: &io::Error) -> bool {
    expected_io_error(err) || err.raw_os_error() == Some(libc::ENOBUFS)
}
