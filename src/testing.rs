//! In-process transport honouring the same contracts as the reactor.
//!
//! Connections come in linked pairs: bytes written to one end are
//! delivered to the other end's handler synchronously in the calling
//! thread. Events that arrive before `set_handler` are queued (with
//! consecutive input chunks coalesced, as a socket would) and replayed
//! in order on binding; events produced while a handler call is already
//! running are queued behind it, so handler calls never nest.
//!
//! A process-wide registry maps addresses to [`listener`]s so that
//! [`connect`] dispatches like the real thing, and a handler table
//! emulates UDP. This transport is the primary test vehicle: handlers
//! and adapters written against [`Conn`] run on it unchanged.
//!
//! [`Conn`]: crate::Conn

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};

use log::{error, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::connection::Conn;
use crate::error::{Error, ProducerItem};
use crate::handler::{ClientHandler, ConnectionHandler, DatagramHandler, ServerHandler};
use crate::net::Address;

enum QueuedCall {
    Input(Vec<u8>),
    Close(String),
    Exception(Error),
}

struct DispatchState {
    bound: bool,
    handler: Option<Box<dyn ConnectionHandler<Connection>>>,
    /// Events recorded before a handler was bound.
    pending: VecDeque<QueuedCall>,
    /// Events produced while a handler call is running.
    queue: VecDeque<QueuedCall>,
    dispatching: bool,
    closed: Option<String>,
}

struct TestConn {
    address: Mutex<Option<Address>>,
    peer: Mutex<Option<Connection>>,
    control: Mutex<Option<Weak<ListenerCore>>>,
    state: Mutex<DispatchState>,
}

/// One end of an in-process connection pair.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<TestConn>,
}

impl Connection {
    fn unpaired() -> Connection {
        Connection {
            inner: Arc::new(TestConn {
                address: Mutex::new(None),
                peer: Mutex::new(None),
                control: Mutex::new(None),
                state: Mutex::new(DispatchState {
                    bound: false,
                    handler: None,
                    pending: VecDeque::new(),
                    queue: VecDeque::new(),
                    dispatching: false,
                    closed: None,
                }),
            }),
        }
    }

    /// Two linked connection ends; what one writes, the other receives.
    pub fn pair() -> (Connection, Connection) {
        let a = Connection::unpaired();
        let b = Connection::unpaired();
        *a.inner.peer.lock() = Some(b.clone());
        *b.inner.peer.lock() = Some(a.clone());
        (a, b)
    }

    /// The other end of the pair.
    pub fn peer(&self) -> Option<Connection> {
        self.inner.peer.lock().clone()
    }

    fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn control(&self) -> Option<Arc<ListenerCore>> {
        self.inner.control.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Test-side injection: delivers bytes as if read from the wire.
    pub fn test_input<B: Into<Vec<u8>>>(&self, data: B) {
        self.deliver(QueuedCall::Input(data.into()));
    }

    /// Test-side injection of a peer close with the given reason.
    pub fn test_close<S: Into<String>>(&self, reason: S) {
        self.deliver(QueuedCall::Close(reason.into()));
    }

    /// Test-side injection of a write-side exception; the connection
    /// closes after delivery, as it does on the socket transport.
    pub fn test_exception(&self, error: Error) {
        self.deliver(QueuedCall::Exception(error));
    }

    fn deliver(&self, call: QueuedCall) {
        let mut st = self.inner.state.lock();
        if !st.bound {
            if let QueuedCall::Input(data) = &call {
                if let Some(QueuedCall::Input(prev)) = st.pending.back_mut() {
                    prev.extend_from_slice(data);
                    return;
                }
            }
            st.pending.push_back(call);
            return;
        }
        if st.dispatching {
            st.queue.push_back(call);
            return;
        }
        st.dispatching = true;
        st.queue.push_back(call);
        self.run_queue(st);
    }

    /// Drains queued handler calls one at a time. The state lock is
    /// released around each handler call; anything the handler produces
    /// lands back on the queue.
    fn run_queue<'a>(&'a self, mut st: MutexGuard<'a, DispatchState>) {
        loop {
            if st.closed.is_some() {
                st.queue.clear();
                break;
            }
            let call = match st.queue.pop_front() {
                Some(call) => call,
                None => break,
            };
            match call {
                QueuedCall::Input(data) => {
                    let handler = st.handler.take();
                    drop(st);
                    if let Some(mut handler) = handler {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            handler.handle_input(self, &data)
                        }));
                        self.restore_handler(handler);
                        if result.is_err() {
                            error!("test connection: handle_input failed");
                            self.do_close();
                            self.deliver_close_directly("handle_input error");
                        }
                    }
                    st = self.inner.state.lock();
                }
                QueuedCall::Close(reason) => {
                    st.closed = Some(reason.clone());
                    let handler = st.handler.take();
                    drop(st);
                    if let Some(control) = self.control() {
                        control.child_closed(self);
                    }
                    if let Some(mut handler) = handler {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            handler.handle_close(self, &reason)
                        }));
                        if result.is_err() {
                            error!("test connection: handle_close({:?}) failed", reason);
                        }
                        self.restore_handler(handler);
                    }
                    st = self.inner.state.lock();
                }
                QueuedCall::Exception(error) => {
                    let reason = error.to_string();
                    let handler = st.handler.take();
                    drop(st);
                    if let Some(mut handler) = handler {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            handler.handle_exception(self, error)
                        }));
                        if result.is_err() {
                            error!("test connection: handle_exception failed");
                        }
                        self.restore_handler(handler);
                    }
                    // A write-side failure is terminal, exactly as on
                    // the socket transport.
                    self.do_close();
                    self.deliver_close_directly(&reason);
                    st = self.inner.state.lock();
                }
            }
        }
        st.dispatching = false;
    }

    fn restore_handler(&self, handler: Box<dyn ConnectionHandler<Connection>>) {
        let mut st = self.inner.state.lock();
        if st.handler.is_none() {
            st.handler = Some(handler);
        }
    }

    /// Terminal `handle_close` outside the dispatch queue, used after a
    /// fault already marked the connection closed.
    fn deliver_close_directly(&self, reason: &str) {
        let handler = self.inner.state.lock().handler.take();
        if let Some(mut handler) = handler {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| handler.handle_close(self, reason)));
            if result.is_err() {
                error!("test connection: handle_close({:?}) failed", reason);
            }
            self.restore_handler(handler);
        }
    }

    /// Local voluntary close: the peer hears `"closed"`, the local
    /// handler hears nothing.
    fn do_close(&self) {
        {
            let mut st = self.inner.state.lock();
            if st.closed.is_some() {
                return;
            }
            st.closed = Some("closed".to_string());
        }
        if let Some(peer) = self.peer() {
            peer.test_close("closed");
        }
        if let Some(control) = self.control() {
            control.child_closed(self);
        }
    }

    /// Close with a terminal local `handle_close(reason)`, as a stopped
    /// listener does to its children.
    pub(crate) fn close_with_reason(&self, reason: &str) {
        if self.inner.state.lock().closed.is_some() {
            return;
        }
        if let Some(peer) = self.peer() {
            peer.test_close("closed");
        }
        self.deliver(QueuedCall::Close(reason.to_string()));
    }

    fn set_address(&self, address: Option<Address>) {
        *self.inner.address.lock() = address;
    }
}

impl Conn for Connection {
    fn set_handler<H>(&self, handler: H) -> Result<(), Error>
    where
        H: ConnectionHandler<Self> + 'static,
    {
        let mut st = self.inner.state.lock();
        if st.bound {
            return Err(Error::HandlerAlreadySet);
        }
        st.bound = true;
        st.handler = Some(Box::new(handler));
        if st.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut st.pending);
        st.queue = pending;
        st.dispatching = true;
        self.run_queue(st);
        Ok(())
    }

    fn write<B>(&self, data: B) -> Result<(), Error>
    where
        B: Into<Vec<u8>>,
    {
        if self.inner.state.lock().closed.is_some() {
            return Err(Error::Closed);
        }
        match self.peer() {
            Some(peer) => {
                peer.test_input(data.into());
                Ok(())
            }
            None => Err(Error::Closed),
        }
    }

    fn writelines<I>(&self, items: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = ProducerItem>,
        I::IntoIter: Send + 'static,
    {
        if self.inner.state.lock().closed.is_some() {
            return Err(Error::Closed);
        }
        // The test transport sends eagerly; a failing item is routed
        // through the handler protocol rather than returned.
        for item in items {
            match item {
                Ok(chunk) => {
                    if self.write(chunk).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    self.test_exception(Error::Producer(err));
                    break;
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.do_close();
    }

    fn peer_address(&self) -> Address {
        self.peer()
            .and_then(|peer| peer.inner.address.lock().clone())
            .unwrap_or_else(Address::unspecified)
    }

    fn is_open(&self) -> bool {
        self.inner.state.lock().closed.is_none()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("testing::Connection")
            .field("address", &*self.inner.address.lock())
            .field("open", &self.is_open())
            .finish()
    }
}

enum Connectable {
    Listener(Listener),
    Queue(Vec<Connection>),
    Recursing,
}

fn registry() -> &'static Mutex<HashMap<Address, Connectable>> {
    static REGISTRY: OnceLock<Mutex<HashMap<Address, Connectable>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Dispatches a connect against the registered listeners, invoking
/// `connected` or `failed_connect("no such server")` synchronously.
pub fn connect<A, H>(addr: A, mut handler: H)
where
    A: Into<Address>,
    H: ClientHandler<Connection> + 'static,
{
    let addr = addr.into();
    enum Action {
        Accept(Listener),
        Connected(Connection),
        Fail,
        Recursing,
    }
    let action = {
        let mut reg = registry().lock();
        match reg.get_mut(&addr) {
            Some(Connectable::Listener(listener)) => Action::Accept(listener.clone()),
            Some(Connectable::Queue(queue)) if !queue.is_empty() => {
                Action::Connected(queue.remove(0))
            }
            Some(Connectable::Recursing) => {
                reg.remove(&addr);
                Action::Recursing
            }
            _ => {
                reg.insert(addr.clone(), Connectable::Recursing);
                Action::Fail
            }
        }
    };
    match action {
        Action::Accept(listener) => listener.accept(handler),
        Action::Connected(conn) => {
            if let Some(peer) = conn.peer() {
                peer.set_address(Some(addr));
            }
            handler.connected(conn);
        }
        Action::Fail => {
            handler.failed_connect("no such server");
            let mut reg = registry().lock();
            if matches!(reg.get(&addr), Some(Connectable::Recursing)) {
                reg.remove(&addr);
            }
        }
        Action::Recursing => {
            warn!(
                "for {}, a connect handler called connect from a failed_connect call",
                addr
            );
        }
    }
}

/// Queues a prepared connection to satisfy the next [`connect`] to
/// `addr`.
pub fn connectable<A: Into<Address>>(addr: A, connection: Connection) {
    let addr = addr.into();
    let mut reg = registry().lock();
    match reg.get_mut(&addr) {
        Some(Connectable::Queue(queue)) => queue.push(connection),
        _ => {
            reg.insert(addr, Connectable::Queue(vec![connection]));
        }
    }
}

struct ListenerCore {
    address: Option<Address>,
    handler: Mutex<Option<Box<dyn ServerHandler<Connection>>>>,
    state: Mutex<ListenerState>,
}

struct ListenerState {
    connections: Vec<Connection>,
    close_handler: Option<Box<dyn FnOnce(&Listener) + Send>>,
}

/// The in-process counterpart of a bound listener.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerCore>,
}

/// Registers a server handler under `addr`; subsequent [`connect`]s to
/// that address are dispatched to it.
pub fn listener<A, H>(addr: A, handler: H) -> Listener
where
    A: Into<Address>,
    H: ServerHandler<Connection> + 'static,
{
    let addr = addr.into();
    let listener = Listener {
        inner: Arc::new(ListenerCore {
            address: Some(addr.clone()),
            handler: Mutex::new(Some(Box::new(handler))),
            state: Mutex::new(ListenerState {
                connections: Vec::new(),
                close_handler: None,
            }),
        }),
    };
    registry()
        .lock()
        .insert(addr, Connectable::Listener(listener.clone()));
    listener
}

impl Listener {
    /// An unregistered listener, connected to directly via
    /// [`Listener::connect`].
    pub fn new<H>(handler: H) -> Listener
    where
        H: ServerHandler<Connection> + 'static,
    {
        Listener {
            inner: Arc::new(ListenerCore {
                address: None,
                handler: Mutex::new(Some(Box::new(handler))),
                state: Mutex::new(ListenerState {
                    connections: Vec::new(),
                    close_handler: None,
                }),
            }),
        }
    }

    pub fn address(&self) -> Option<Address> {
        self.inner.address.clone()
    }

    /// Connects straight to this listener, bypassing the registry.
    pub fn connect<H>(&self, handler: H)
    where
        H: ClientHandler<Connection> + 'static,
    {
        self.accept(handler);
    }

    fn accept<H>(&self, mut client: H)
    where
        H: ClientHandler<Connection>,
    {
        if self.inner.handler.lock().is_none() {
            client.failed_connect("listener closed");
            return;
        }
        let (server_end, client_end) = Connection::pair();
        server_end.set_address(self.inner.address.clone());
        *server_end.inner.control.lock() = Some(Arc::downgrade(&self.inner));
        self.inner
            .state
            .lock()
            .connections
            .push(server_end.clone());
        let handler = self.inner.handler.lock().take();
        if let Some(mut handler) = handler {
            let served = server_end.clone();
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| handler.handle_connection(served)));
            {
                let mut slot = self.inner.handler.lock();
                if slot.is_none() {
                    *slot = Some(handler);
                }
            }
            if result.is_err() {
                error!("test server handler failed");
                self.close();
                return;
            }
        }
        client.connected(client_end);
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.state.lock().connections.clone()
    }

    /// Closes the listener and all of its children immediately; each
    /// child receives a terminal close with reason `"stopped"`.
    pub fn close(&self) {
        self.close_impl(None);
    }

    /// Stops accepting; `notify` fires once the last child closes.
    pub fn close_notify<F>(&self, notify: F)
    where
        F: FnOnce(&Listener) + Send + 'static,
    {
        self.close_impl(Some(Box::new(notify)));
    }

    fn close_impl(&self, notify: Option<Box<dyn FnOnce(&Listener) + Send>>) {
        if let Some(addr) = &self.inner.address {
            let mut reg = registry().lock();
            if matches!(reg.get(addr), Some(Connectable::Listener(_))) {
                reg.remove(addr);
            }
        }
        *self.inner.handler.lock() = None;
        match notify {
            None => {
                let connections = self.inner.state.lock().connections.clone();
                for conn in connections {
                    conn.close_with_reason("stopped");
                }
            }
            Some(notify) => {
                let mut st = self.inner.state.lock();
                if st.connections.is_empty() {
                    drop(st);
                    notify(self);
                } else {
                    st.close_handler = Some(notify);
                }
            }
        }
    }
}

impl ListenerCore {
    fn child_closed(self: &Arc<ListenerCore>, conn: &Connection) {
        let mut st = self.state.lock();
        let before = st.connections.len();
        st.connections.retain(|child| !child.same(conn));
        if st.connections.len() == before || !st.connections.is_empty() {
            return;
        }
        if let Some(notify) = st.close_handler.take() {
            drop(st);
            let listener = Listener {
                inner: Arc::clone(self),
            };
            notify(&listener);
        }
    }
}

type SharedDatagramHandler = Arc<Mutex<Box<dyn DatagramHandler>>>;

fn udp_registry() -> &'static Mutex<HashMap<Address, (SharedDatagramHandler, usize)>> {
    static REGISTRY: OnceLock<Mutex<HashMap<Address, (SharedDatagramHandler, usize)>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The in-process counterpart of a UDP listener: a handler-table entry.
pub struct UdpListener {
    address: Address,
}

pub fn udp_listener<A, H>(addr: A, handler: H, buffer_size: usize) -> UdpListener
where
    A: Into<Address>,
    H: DatagramHandler + 'static,
{
    let address = addr.into();
    udp_registry().lock().insert(
        address.clone(),
        (Arc::new(Mutex::new(Box::new(handler))), buffer_size),
    );
    UdpListener { address }
}

impl UdpListener {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn close(&self) {
        udp_registry().lock().remove(&self.address);
    }
}

/// Delivers a datagram to the handler registered under `addr`, if any,
/// truncated to the listener's buffer size.
pub fn udp<A, B>(addr: A, data: B)
where
    A: Into<Address>,
    B: AsRef<[u8]>,
{
    let addr = addr.into();
    let data = data.as_ref();
    let entry = udp_registry().lock().get(&addr).map(|(h, n)| (Arc::clone(h), *n));
    if let Some((handler, buffer_size)) = entry {
        let n = data.len().min(buffer_size);
        handler
            .lock()
            .handle_datagram(&Address::unspecified(), &data[..n]);
    }
}
