use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::Error;
use crate::handler::{ClientHandler, DatagramHandler, ServerHandler};
use crate::interest::Interest;
use crate::net::{Address, DatagramSocket, ListenSocket};
use crate::poll::Registration;
use crate::reactor::{Core, Endpoint, Reactor};
use crate::token::Token;

/// A bound stream listener handing accepted connections to a server
/// handler.
///
/// The listener keeps track of its live children: [`Listener::close`]
/// closes them immediately, while [`Listener::close_notify`] stops
/// accepting and fires a callback once the last child has closed.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

pub(crate) struct ListenerInner {
    core: Arc<Core>,
    token: Token,
    address: Address,
    thready: bool,
    accepting: AtomicBool,
    handler: Mutex<Option<Box<dyn ServerHandler<Connection>>>>,
    state: Mutex<ListenerState>,
}

struct ListenerState {
    socket: Option<ListenSocket>,
    registration: Option<Registration>,
    children: Vec<Connection>,
    close_handler: Option<Box<dyn FnOnce(&Listener) + Send>>,
    closed: bool,
}

impl Listener {
    pub(crate) fn bind(
        core: &Arc<Core>,
        addr: Address,
        handler: Box<dyn ServerHandler<Connection>>,
        thready: bool,
    ) -> Result<Listener, Error> {
        let socket = ListenSocket::bind(&addr).map_err(|err| {
            warn!("unable to listen on {}: {}", addr, err);
            err
        })?;
        // Binding port 0 picks a free port; report the bound result.
        let address = match &addr {
            Address::Inet(_) => socket.local_addr()?,
            other => other.clone(),
        };
        info!("listening on {}", address);
        let listener = Listener {
            inner: Arc::new(ListenerInner {
                core: Arc::clone(core),
                token: core.next_token(),
                address,
                thready,
                accepting: AtomicBool::new(true),
                handler: Mutex::new(Some(handler)),
                state: Mutex::new(ListenerState {
                    socket: Some(socket),
                    registration: None,
                    children: Vec::new(),
                    close_handler: None,
                    closed: false,
                }),
            }),
        };
        let registered = listener.clone();
        core.post(move || registered.register());
        Ok(listener)
    }

    /// Registers the bound socket with the selector. Selector thread
    /// only.
    fn register(&self) {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.closed {
            return;
        }
        let fd = match st.socket.as_ref() {
            Some(socket) => socket.as_raw_fd(),
            None => return,
        };
        let mut registration = Registration::new(inner.core.registry().clone(), inner.token, fd);
        if let Err(err) = registration.ensure(Some(Interest::READABLE)) {
            error!("{}: failed to register listener: {}", inner.address, err);
            return;
        }
        st.registration = Some(registration);
        drop(st);
        inner
            .core
            .insert_endpoint(inner.token, Endpoint::Listener(self.clone()));
    }

    /// The bound address; for IP listeners this reflects the
    /// OS-assigned port when port 0 was requested.
    pub fn address(&self) -> Address {
        self.inner.address.clone()
    }

    /// A snapshot of the currently open child connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.state.lock().children.clone()
    }

    /// Dials this listener's own address on its reactor.
    pub fn connect<H>(&self, handler: H)
    where
        H: ClientHandler<Connection> + 'static,
    {
        Reactor::from_core(Arc::clone(&self.inner.core)).connect(self.address(), handler);
    }

    /// Stops accepting and closes the listener and all of its children
    /// immediately; each child receives a terminal close with reason
    /// `"stopped"`.
    pub fn close(&self) {
        self.close_impl(None);
    }

    /// Stops accepting but leaves existing children running; `notify`
    /// is invoked on the selector thread once the last child closes.
    pub fn close_notify<F>(&self, notify: F)
    where
        F: FnOnce(&Listener) + Send + 'static,
    {
        self.close_impl(Some(Box::new(notify)));
    }

    /// Like [`Listener::close_notify`], blocking the calling thread
    /// until the children have drained.
    pub fn close_wait(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let (done_tx, done_rx) = bounded::<()>(1);
        self.close_notify(move |_| {
            let _ = done_tx.send(());
        });
        match timeout {
            Some(timeout) => done_rx.recv_timeout(timeout).map_err(|_| Error::Timeout),
            None => done_rx.recv().map_err(|_| Error::Timeout),
        }
    }

    fn close_impl(&self, notify: Option<Box<dyn FnOnce(&Listener) + Send>>) {
        self.inner.accepting.store(false, Ordering::Release);
        let listener = self.clone();
        // Deferred even from the selector thread: closing children
        // re-enters connection state that may be mid-dispatch.
        self.inner
            .core
            .post_deferred(move || listener.finish_close(notify));
    }

    fn finish_close(&self, notify: Option<Box<dyn FnOnce(&Listener) + Send>>) {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if !st.closed {
            st.closed = true;
            st.registration = None;
            st.socket = None;
            inner.core.remove_endpoint(inner.token);
            if let Address::Unix(path) = &inner.address {
                if let Err(err) = fs::remove_file(path) {
                    debug!("could not remove {}: {}", path.display(), err);
                }
            }
        }
        match notify {
            None => {
                let children = st.children.clone();
                drop(st);
                for child in children {
                    child.force_close("stopped");
                }
            }
            Some(notify) => {
                if st.children.is_empty() {
                    drop(st);
                    notify(self);
                } else {
                    st.close_handler = Some(notify);
                }
            }
        }
    }

    /// Accept readiness: drain the backlog, registering each accepted
    /// stream as a child connection and handing it to the server
    /// handler. Selector thread only.
    pub(crate) fn dispatch_accept(&self) {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Acquire) {
            return;
        }
        loop {
            let accepted = {
                let st = inner.state.lock();
                match st.socket.as_ref() {
                    Some(socket) => socket.accept(),
                    None => return,
                }
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("{}: accept failed: {}", inner.address, err);
                    return;
                }
            };
            debug!("{}: incoming connection from {}", inner.address, peer);
            let core = if inner.thready {
                match Reactor::with_name(format!("{} client", inner.address)) {
                    Ok(reactor) => Arc::clone(reactor.core()),
                    Err(err) => {
                        warn!(
                            "{}: failed to create per-client reactor: {}",
                            inner.address, err
                        );
                        Arc::clone(&inner.core)
                    }
                }
            } else {
                Arc::clone(&inner.core)
            };
            let conn = Connection::register(&core, stream, peer, Some(Arc::downgrade(&self.inner)));
            inner.state.lock().children.push(conn.clone());
            let listener = self.clone();
            core.post(move || listener.serve(conn));
        }
    }

    /// Invokes the server handler with one accepted connection; a
    /// faulting handler closes the listener.
    fn serve(&self, conn: Connection) {
        let inner = &self.inner;
        let faulted = {
            let mut handler = inner.handler.lock();
            match handler.as_mut() {
                Some(handler) => {
                    panic::catch_unwind(AssertUnwindSafe(|| handler.handle_connection(conn))).err()
                }
                None => None,
            }
        };
        if faulted.is_some() {
            error!("{}: server handler failed", inner.address);
            self.close();
        }
    }
}

impl ListenerInner {
    /// Called by a child connection as it closes; fires the graceful
    /// close notification when the last one goes.
    pub(crate) fn child_closed(self: &Arc<ListenerInner>, conn: &Connection) {
        let mut st = self.state.lock();
        let before = st.children.len();
        st.children.retain(|child| !child.same_connection(conn));
        if st.children.len() == before || !st.children.is_empty() {
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

/// A bound datagram endpoint invoking a handler per received datagram.
#[derive(Clone)]
pub struct UdpListener {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    core: Arc<Core>,
    token: Token,
    address: Address,
    buffer_size: usize,
    handler: Mutex<Box<dyn DatagramHandler>>,
    state: Mutex<UdpState>,
}

struct UdpState {
    socket: Option<DatagramSocket>,
    registration: Option<Registration>,
    closed: bool,
}

impl UdpListener {
    pub(crate) fn bind(
        core: &Arc<Core>,
        addr: Address,
        handler: Box<dyn DatagramHandler>,
        buffer_size: usize,
    ) -> Result<UdpListener, Error> {
        let socket = DatagramSocket::bind(&addr).map_err(|err| {
            warn!("unable to listen on udp {}: {}", addr, err);
            err
        })?;
        let address = match &addr {
            Address::Inet(_) => socket.local_addr()?,
            other => other.clone(),
        };
        info!("listening on udp {}", address);
        let listener = UdpListener {
            inner: Arc::new(UdpInner {
                core: Arc::clone(core),
                token: core.next_token(),
                address,
                buffer_size,
                handler: Mutex::new(handler),
                state: Mutex::new(UdpState {
                    socket: Some(socket),
                    registration: None,
                    closed: false,
                }),
            }),
        };
        let registered = listener.clone();
        core.post(move || registered.register());
        Ok(listener)
    }

    fn register(&self) {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.closed {
            return;
        }
        let fd = match st.socket.as_ref() {
            Some(socket) => socket.as_raw_fd(),
            None => return,
        };
        let mut registration = Registration::new(inner.core.registry().clone(), inner.token, fd);
        if let Err(err) = registration.ensure(Some(Interest::READABLE)) {
            error!("{}: failed to register udp listener: {}", inner.address, err);
            return;
        }
        st.registration = Some(registration);
        drop(st);
        inner
            .core
            .insert_endpoint(inner.token, Endpoint::Udp(self.clone()));
    }

    pub fn address(&self) -> Address {
        self.inner.address.clone()
    }

    pub fn close(&self) {
        let listener = self.clone();
        self.inner.core.post_deferred(move || {
            let inner = &listener.inner;
            let mut st = inner.state.lock();
            st.closed = true;
            st.registration = None;
            st.socket = None;
            inner.core.remove_endpoint(inner.token);
        });
    }

    /// Read readiness: receive one datagram and hand it to the handler.
    /// The level-triggered selector re-signals while more are queued.
    pub(crate) fn dispatch_datagram(&self) {
        let inner = &self.inner;
        let mut buf = vec![0u8; inner.buffer_size];
        let received = {
            let st = inner.state.lock();
            match st.socket.as_ref() {
                Some(socket) => socket.recv_from(&mut buf),
                None => return,
            }
        };
        match received {
            Ok((n, peer)) => {
                let faulted = {
                    let mut handler = inner.handler.lock();
                    panic::catch_unwind(AssertUnwindSafe(|| {
                        handler.handle_datagram(&peer, &buf[..n])
                    }))
                    .err()
                };
                if let Some(payload) = faulted {
                    error!("{}: datagram handler failed", inner.address);
                    self.close();
                    panic::resume_unwind(payload);
                }
            }
            Err(ref err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                warn!("{}: receive failed: {}", inner.address, err);
                self.close();
            }
        }
    }
}
