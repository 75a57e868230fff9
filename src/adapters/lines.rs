use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Conn;
use crate::error::{Error, ProducerItem};
use crate::handler::ConnectionHandler;
use crate::net::Address;

/// Newline framing over any connection.
///
/// Input is delivered to the handler once per complete `\n`-terminated
/// line, without the terminator; an unterminated trailing fragment is
/// retained until its newline arrives and is never delivered on its
/// own. Output, close and exception events pass straight through.
pub struct Lines<C: Conn> {
    inner: Arc<LinesInner<C>>,
}

struct LinesInner<C: Conn> {
    conn: C,
    state: Mutex<LinesState<C>>,
}

struct LinesState<C: Conn> {
    buffer: Vec<u8>,
    handler: Option<Box<dyn ConnectionHandler<Lines<C>>>>,
}

impl<C: Conn> Lines<C> {
    pub fn new(conn: C) -> Lines<C> {
        Lines {
            inner: Arc::new(LinesInner {
                conn,
                state: Mutex::new(LinesState {
                    buffer: Vec::new(),
                    handler: None,
                }),
            }),
        }
    }

    /// The wrapped connection.
    pub fn connection(&self) -> &C {
        &self.inner.conn
    }
}

impl<C: Conn> Clone for Lines<C> {
    fn clone(&self) -> Lines<C> {
        Lines {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Conn> Conn for Lines<C> {
    fn set_handler<H>(&self, handler: H) -> Result<(), Error>
    where
        H: ConnectionHandler<Self> + 'static,
    {
        {
            // A failed try_lock is a reentrant bind from inside this
            // adapter's own dispatch.
            let mut st = match self.inner.state.try_lock() {
                Some(st) => st,
                None => return Err(Error::HandlerAlreadySet),
            };
            if st.handler.is_some() {
                return Err(Error::HandlerAlreadySet);
            }
            st.handler = Some(Box::new(handler));
        }
        self.inner.conn.set_handler(LinesDispatch {
            adapter: self.clone(),
        })
    }

    fn write<B>(&self, data: B) -> Result<(), Error>
    where
        B: Into<Vec<u8>>,
    {
        self.inner.conn.write(data)
    }

    fn writelines<I>(&self, items: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = ProducerItem>,
        I::IntoIter: Send + 'static,
    {
        self.inner.conn.writelines(items)
    }

    fn close(&self) {
        self.inner.conn.close()
    }

    fn peer_address(&self) -> Address {
        self.inner.conn.peer_address()
    }

    fn is_open(&self) -> bool {
        self.inner.conn.is_open()
    }
}

/// The handler the adapter binds on the wrapped connection.
struct LinesDispatch<C: Conn> {
    adapter: Lines<C>,
}

impl<C: Conn> ConnectionHandler<C> for LinesDispatch<C> {
    fn handle_input(&mut self, _conn: &C, data: &[u8]) {
        let mut st = self.adapter.inner.state.lock();
        st.buffer.extend_from_slice(data);
        // Split out every complete line before dispatching any of them,
        // so a handler feeding data back never sees a half-split buffer.
        let mut lines = Vec::new();
        while let Some(pos) = st.buffer.iter().position(|&byte| byte == b'\n') {
            let mut line: Vec<u8> = st.buffer.drain(..=pos).collect();
            line.pop();
            lines.push(line);
        }
        let LinesState { handler, .. } = &mut *st;
        if let Some(handler) = handler.as_mut() {
            for line in &lines {
                handler.handle_input(&self.adapter, line);
            }
        }
    }

    fn handle_close(&mut self, _conn: &C, reason: &str) {
        let mut st = self.adapter.inner.state.lock();
        let LinesState { handler, .. } = &mut *st;
        if let Some(handler) = handler.as_mut() {
            handler.handle_close(&self.adapter, reason);
        }
    }

    fn handle_exception(&mut self, _conn: &C, error: Error) {
        let mut st = self.adapter.inner.state.lock();
        let LinesState { handler, .. } = &mut *st;
        if let Some(handler) = handler.as_mut() {
            handler.handle_exception(&self.adapter, error);
        }
    }
}
