use std::io;
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::connection::{Conn, Connection};
use crate::event::Event;
use crate::handler::ClientHandler;
use crate::interest::Interest;
use crate::net::{Address, Progress, StreamSocket};
use crate::poll::Registration;
use crate::reactor::{Core, Endpoint};
use crate::sys;
use crate::token::Token;

/// An outbound connect in flight.
///
/// The initial `connect(2)` happens on the selector thread as soon as
/// the request is scheduled; an in-progress result parks the socket
/// with write interest and re-drives the connect on readiness. Whatever
/// the outcome, connector resources are released and the handler hears
/// exactly one of `connected` / `failed_connect`.
#[derive(Clone)]
pub(crate) struct Connector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    core: Arc<Core>,
    token: Token,
    addr: Address,
    state: Mutex<Option<Pending>>,
}

struct Pending {
    socket: StreamSocket,
    handler: Box<dyn ClientHandler<Connection>>,
    registration: Option<Registration>,
}

impl Connector {
    /// Selector thread only.
    pub(crate) fn start(
        core: &Arc<Core>,
        addr: Address,
        mut handler: Box<dyn ClientHandler<Connection>>,
    ) {
        debug!("connecting to {}", addr);
        match StreamSocket::connect(&addr) {
            Err(err) => {
                let reason = reason_for(&err);
                warn!("error connecting to {}: {}", addr, reason);
                deliver_failure(&mut handler, &reason);
            }
            Ok((socket, Progress::Connected)) => promote(core, socket, addr, handler),
            Ok((socket, Progress::InProgress)) => {
                let token = core.next_token();
                let mut registration =
                    Registration::new(core.registry().clone(), token, socket.as_raw_fd());
                if let Err(err) = registration.ensure(Some(Interest::WRITABLE)) {
                    let reason = reason_for(&err);
                    warn!("error connecting to {}: {}", addr, reason);
                    deliver_failure(&mut handler, &reason);
                    return;
                }
                let connector = Connector {
                    inner: Arc::new(ConnectorInner {
                        core: Arc::clone(core),
                        token,
                        addr,
                        state: Mutex::new(Some(Pending {
                            socket,
                            handler,
                            registration: Some(registration),
                        })),
                    }),
                };
                core.insert_endpoint(token, Endpoint::Connector(connector.clone()));
            }
        }
    }

    /// Any readiness on the connecting socket resolves the attempt:
    /// re-driving `connect(2)` reports success, still-in-progress, or
    /// the final error.
    pub(crate) fn dispatch_event(&self, _event: &Event) {
        let inner = &self.inner;
        let mut pending = match inner.state.lock().take() {
            Some(pending) => pending,
            None => return,
        };
        match pending.socket.connect_again(&inner.addr) {
            Ok(Progress::InProgress) => {
                *inner.state.lock() = Some(pending);
            }
            Ok(Progress::Connected) => {
                inner.core.remove_endpoint(inner.token);
                pending.registration = None;
                promote(
                    &inner.core,
                    pending.socket,
                    inner.addr.clone(),
                    pending.handler,
                );
            }
            Err(err) => {
                let reason = reason_for(&err);
                warn!("error connecting to {}: {}", inner.addr, reason);
                inner.core.remove_endpoint(inner.token);
                pending.registration = None;
                deliver_failure(&mut pending.handler, &reason);
            }
        }
    }
}

/// Turns an established socket into a registered connection and tells
/// the handler.
fn promote(
    core: &Arc<Core>,
    socket: StreamSocket,
    addr: Address,
    mut handler: Box<dyn ClientHandler<Connection>>,
) {
    debug!("outgoing connection to {}", addr);
    let conn = Connection::register(core, socket, addr, None);
    let connected = conn.clone();
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler.connected(connected)));
    if result.is_err() {
        error!("connection handler failed for {}", conn.peer_address());
        conn.force_close("connection handler failed");
    }
}

fn deliver_failure(handler: &mut Box<dyn ClientHandler<Connection>>, reason: &str) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler.failed_connect(reason)));
    if let Err(payload) = result {
        error!("failed_connect({:?}) handler failed", reason);
        panic::resume_unwind(payload);
    }
}

/// Maps a connect error to the errno name the handler protocol reports,
/// falling back to the OS error string.
pub(crate) fn reason_for(err: &io::Error) -> String {
    match err.raw_os_error().and_then(sys::errno_name) {
        Some(name) => name.to_string(),
        None => err.to_string(),
    }
}
