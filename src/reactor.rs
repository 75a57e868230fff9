use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::connection::Connection;
use crate::connector::Connector;
use crate::error::Error;
use crate::event::Events;
use crate::handler::{ClientHandler, DatagramHandler, ServerHandler};
use crate::listener::{Listener, UdpListener};
use crate::net::{Address, DatagramSocket};
use crate::poll::{Poll, Registry};
use crate::token::Token;
use crate::waker::Waker;

/// Token reserved for the wakeup pipe.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Upper bound on a single selector poll.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

type Callback = Box<dyn FnOnce() + Send>;

/// Everything the selector can hand a readiness event to.
#[derive(Clone)]
pub(crate) enum Endpoint {
    Conn(Connection),
    Listener(Listener),
    Udp(UdpListener),
    Connector(Connector),
}

/// An event-driven I/O runtime: one selector thread owning a set of
/// non-blocking endpoints.
///
/// The thread is started lazily by the first endpoint or posted
/// callback and exits once the registered set drains, so an idle
/// `Reactor` costs nothing but its selector fd. All handler callbacks
/// run on the selector thread, strictly serialised per connection;
/// `write`, `close`, `connect`, `listen` and `post` are safe to call
/// from any thread.
///
/// Most applications use the process-wide [`global`] reactor through
/// the top-level functions; construct a `Reactor` explicitly for
/// isolation, or with [`Reactor::inline`] to drive the loop from the
/// calling thread and have handler faults re-raised into it.
#[derive(Clone)]
pub struct Reactor {
    core: Arc<Core>,
}

struct Lifecycle {
    running: bool,
}

pub(crate) struct Core {
    name: String,
    inline: bool,
    poll: Poll,
    callbacks_tx: Sender<Callback>,
    callbacks_rx: Receiver<Callback>,
    waker: Mutex<Option<Arc<Waker>>>,
    endpoints: Mutex<HashMap<Token, Endpoint>>,
    next_token: AtomicUsize,
    lifecycle: Mutex<Lifecycle>,
    idle: Condvar,
    selector_thread: Mutex<Option<ThreadId>>,
}

impl Reactor {
    pub fn new() -> Result<Reactor, Error> {
        Reactor::with_name("ngi")
    }

    /// A reactor whose selector thread carries `name`, which also
    /// prefixes its log records.
    pub fn with_name<S: Into<String>>(name: S) -> Result<Reactor, Error> {
        Reactor::build(name.into(), false)
    }

    /// A reactor without a thread of its own: [`Reactor::wait`] runs
    /// the selector loop in the calling thread, and handler panics are
    /// re-raised into that caller instead of being swallowed.
    pub fn inline() -> Result<Reactor, Error> {
        Reactor::build("ngi-inline".into(), true)
    }

    fn build(name: String, inline: bool) -> Result<Reactor, Error> {
        let poll = Poll::new()?;
        let (callbacks_tx, callbacks_rx) = unbounded();
        Ok(Reactor {
            core: Arc::new(Core {
                name,
                inline,
                poll,
                callbacks_tx,
                callbacks_rx,
                waker: Mutex::new(None),
                endpoints: Mutex::new(HashMap::new()),
                next_token: AtomicUsize::new(0),
                lifecycle: Mutex::new(Lifecycle { running: false }),
                idle: Condvar::new(),
                selector_thread: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn from_core(core: Arc<Core>) -> Reactor {
        Reactor { core }
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Starts a non-blocking connect to `addr`. The handler receives
    /// `connected(conn)` or `failed_connect(reason)` exactly once, on
    /// the selector thread.
    pub fn connect<A, H>(&self, addr: A, handler: H)
    where
        A: Into<Address>,
        H: ClientHandler<Connection> + 'static,
    {
        let addr = addr.into();
        let core = Arc::clone(&self.core);
        self.core
            .post(move || Connector::start(&core, addr, Box::new(handler)));
    }

    /// Binds a listener on `addr` and invokes `handler` with each
    /// accepted connection. Binding errors surface here; accept errors
    /// are logged and do not stop the listener.
    pub fn listen<A, H>(&self, addr: A, handler: H) -> Result<Listener, Error>
    where
        A: Into<Address>,
        H: ServerHandler<Connection> + 'static,
    {
        Listener::bind(&self.core, addr.into(), Box::new(handler), false)
    }

    /// Like [`Reactor::listen`], but every accepted connection is
    /// serviced by a freshly created reactor with a thread of its own.
    pub fn listen_per_client<A, H>(&self, addr: A, handler: H) -> Result<Listener, Error>
    where
        A: Into<Address>,
        H: ServerHandler<Connection> + 'static,
    {
        Listener::bind(&self.core, addr.into(), Box::new(handler), true)
    }

    /// Binds a UDP (or unix-domain datagram) listener. Each received
    /// datagram, truncated to `buffer_size`, is handed to `handler` on
    /// the selector thread.
    pub fn udp_listen<A, H>(
        &self,
        addr: A,
        handler: H,
        buffer_size: usize,
    ) -> Result<UdpListener, Error>
    where
        A: Into<Address>,
        H: DatagramHandler + 'static,
    {
        UdpListener::bind(&self.core, addr.into(), Box::new(handler), buffer_size)
    }

    /// Best-effort, non-blocking datagram send from the calling thread.
    /// Sockets are pooled per address family and never closed.
    pub fn udp_send<A, B>(&self, addr: A, data: B) -> Result<(), Error>
    where
        A: Into<Address>,
        B: AsRef<[u8]>,
    {
        udp_send(addr, data)
    }

    /// Runs `f` on the selector thread: inline when already on it,
    /// otherwise queued behind a wakeup pulse.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.post(f);
    }

    /// Blocks until the selector thread exits, i.e. until the
    /// registered set has drained. Fails with [`Error::Timeout`] when
    /// the deadline elapses first. On an inline reactor this *runs* the
    /// loop instead of waiting for it.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        if self.core.inline {
            return Core::run_loop(&self.core, deadline);
        }
        let mut lifecycle = self.core.lifecycle.lock();
        while lifecycle.running {
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    if self.core.idle.wait_until(&mut lifecycle, deadline).timed_out()
                        && lifecycle.running
                    {
                        return Err(Error::Timeout);
                    }
                }
                None => self.core.idle.wait(&mut lifecycle),
            }
        }
        Ok(())
    }

    /// Whether a selector thread currently exists.
    pub fn is_running(&self) -> bool {
        self.core.lifecycle.lock().running
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Reactor")
            .field("name", &self.core.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Core {
    pub(crate) fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert_endpoint(&self, token: Token, endpoint: Endpoint) {
        self.endpoints.lock().insert(token, endpoint);
    }

    pub(crate) fn remove_endpoint(&self, token: Token) {
        self.endpoints.lock().remove(&token);
    }

    pub(crate) fn is_selector_thread(&self) -> bool {
        *self.selector_thread.lock() == Some(thread::current().id())
    }

    pub(crate) fn post(self: &Arc<Core>, f: impl FnOnce() + Send + 'static) {
        if self.is_selector_thread() {
            f();
            return;
        }
        self.post_deferred(f);
    }

    /// Queues `f` for the selector thread even when called from it.
    /// Used where running inline could re-enter the state of the
    /// endpoint currently being dispatched.
    pub(crate) fn post_deferred(self: &Arc<Core>, f: impl FnOnce() + Send + 'static) {
        {
            let mut lifecycle = self.lifecycle.lock();
            let _ = self.callbacks_tx.send(Box::new(f));
            if !lifecycle.running && !self.inline {
                lifecycle.running = true;
                let core = Arc::clone(self);
                let spawned = thread::Builder::new()
                    .name(self.name.clone())
                    .spawn(move || {
                        let _ = Core::run_loop(&core, None);
                    });
                if let Err(err) = spawned {
                    error!("{}: failed to start selector thread: {}", self.name, err);
                    lifecycle.running = false;
                }
            }
        }
        self.wake();
    }

    pub(crate) fn wake(&self) {
        if let Some(waker) = self.waker.lock().as_ref() {
            waker.wake();
        }
    }

    fn run_loop(core: &Arc<Core>, deadline: Option<Instant>) -> Result<(), Error> {
        *core.selector_thread.lock() = Some(thread::current().id());
        debug!("{}: selector loop starting", core.name);
        let result = panic::catch_unwind(AssertUnwindSafe(|| core.loop_body(deadline)));
        // On a panic the loop body skipped its own waker teardown; no
        // successor loop can have started yet, `running` is still set.
        if result.is_err() {
            if let Some(waker) = core.waker.lock().take() {
                waker.close();
            }
        }
        // A clean drain-exit already flipped `running` atomically with
        // the emptiness check; abnormal exits do it here. A successor
        // loop cannot exist yet in the abnormal case, because nothing
        // spawns one while `running` is still set.
        if !matches!(result, Ok(Ok(()))) {
            let mut lifecycle = core.lifecycle.lock();
            lifecycle.running = false;
            core.idle.notify_all();
        }
        {
            let mut ident = core.selector_thread.lock();
            if *ident == Some(thread::current().id()) {
                *ident = None;
            }
        }
        debug!("{}: selector loop finished", core.name);
        match result {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    fn loop_body(self: &Arc<Core>, deadline: Option<Instant>) -> Result<(), Error> {
        let mut waker = Arc::new(Waker::new(self.poll.registry(), WAKER_TOKEN)?);
        *self.waker.lock() = Some(Arc::clone(&waker));
        let result = self.loop_iterations(deadline, &mut waker);
        self.release_waker(&waker);
        result
    }

    fn loop_iterations(
        self: &Arc<Core>,
        deadline: Option<Instant>,
        waker: &mut Arc<Waker>,
    ) -> Result<(), Error> {
        let mut events = Events::with_capacity(256);
        loop {
            while let Ok(callback) = self.callbacks_rx.try_recv() {
                self.guard("callback failed", callback);
            }

            let mut timeout = MAX_POLL_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout);
                }
                timeout = timeout.min(deadline - now);
            }

            // With nothing but the wakeup registered there is no
            // readiness to wait for; fall through to the exit check.
            if !self.endpoints.lock().is_empty() {
                match self.poll.poll(&mut events, Some(timeout)) {
                    Ok(()) => {}
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        error!("{}: selector poll failed: {}", self.name, err);
                        return Err(err.into());
                    }
                }
                for event in events.iter() {
                    let token = event.token();
                    if token == WAKER_TOKEN {
                        waker.drain();
                        continue;
                    }
                    let endpoint = self.endpoints.lock().get(&token).cloned();
                    match endpoint {
                        Some(endpoint) => self.guard("dispatch failed", move || match endpoint {
                            Endpoint::Conn(conn) => conn.dispatch_event(&event),
                            Endpoint::Listener(listener) => listener.dispatch_accept(),
                            Endpoint::Udp(udp) => udp.dispatch_datagram(),
                            Endpoint::Connector(connector) => connector.dispatch_event(&event),
                        }),
                        None => trace!("{}: stale event for {:?}", self.name, token),
                    }
                }
            }

            if waker.is_closed() {
                debug!("{}: recreating wakeup", self.name);
                *waker = Arc::new(Waker::new(self.poll.registry(), WAKER_TOKEN)?);
                *self.waker.lock() = Some(Arc::clone(waker));
            }

            // Exit when only the wakeup remains and nothing is queued.
            // `running` flips under the same lock that `post` enqueues
            // under, so a callback races either into this loop or into
            // the thread the next `post` starts, never into the gap.
            let mut lifecycle = self.lifecycle.lock();
            if self.endpoints.lock().is_empty() && self.callbacks_rx.is_empty() {
                lifecycle.running = false;
                self.idle.notify_all();
                return Ok(());
            }
        }
    }

    fn release_waker(&self, waker: &Arc<Waker>) {
        let mut slot = self.waker.lock();
        if slot
            .as_ref()
            .map_or(false, |current| Arc::ptr_eq(current, waker))
        {
            *slot = None;
        }
        drop(slot);
        waker.close();
    }

    /// Runs user code without letting a fault take the loop down: the
    /// panic is logged and swallowed, except on an inline reactor where
    /// it is re-raised into the thread driving the loop.
    fn guard(&self, ctx: &str, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            error!("{}: {}: {}", self.name, ctx, panic_message(payload.as_ref()));
            if self.inline {
                panic::resume_unwind(payload);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "panic"
    }
}

fn udp_pool(addr: &Address) -> &'static Mutex<Vec<DatagramSocket>> {
    static V4: Mutex<Vec<DatagramSocket>> = Mutex::new(Vec::new());
    static V6: Mutex<Vec<DatagramSocket>> = Mutex::new(Vec::new());
    static UNIX: Mutex<Vec<DatagramSocket>> = Mutex::new(Vec::new());
    match addr {
        Address::Inet(addr) if addr.is_ipv4() => &V4,
        Address::Inet(_) => &V6,
        Address::Unix(_) => &UNIX,
    }
}

/// Best-effort datagram send using a pooled socket per address family.
/// The pool is process-wide and its sockets are never closed.
pub(crate) fn udp_send<A, B>(addr: A, data: B) -> Result<(), Error>
where
    A: Into<Address>,
    B: AsRef<[u8]>,
{
    let addr = addr.into();
    let data = data.as_ref();
    let pool = udp_pool(&addr);
    let socket = match pool.lock().pop() {
        Some(socket) => socket,
        None => DatagramSocket::unbound_for(&addr)?,
    };
    match socket.send_to(data, &addr) {
        Ok(_) => {}
        // Best effort: a send the kernel cannot take right now is
        // dropped, not queued.
        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
            trace!("udp send to {} dropped: would block", addr);
        }
        Err(err) => return Err(err.into()),
    }
    pool.lock().push(socket);
    Ok(())
}

static GLOBAL: OnceLock<Reactor> = OnceLock::new();

/// The process-wide default reactor, created on first use. Its selector
/// thread exits whenever no endpoints remain and restarts on demand.
pub fn global() -> &'static Reactor {
    GLOBAL.get_or_init(|| Reactor::with_name("ngi").expect("failed to create the global reactor"))
}
