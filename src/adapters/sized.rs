use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::connection::Conn;
use crate::error::Error;
use crate::handler::ConnectionHandler;
use crate::net::Address;

/// Wire marker for a NULL message: the reserved length value
/// `0xFFFF_FFFF` with no payload following.
const NULL_MARKER: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

/// Receives whole messages from a [`Sized`] adapter.
///
/// `message` is `None` for a NULL message; an empty `Some` is a
/// zero-length message, which is distinct.
pub trait MessageHandler<C>: Send {
    fn handle_message(&mut self, conn: &C, message: Option<&[u8]>);

    fn handle_close(&mut self, conn: &C, reason: &str) {
        let _ = (conn, reason);
    }

    fn handle_exception(&mut self, conn: &C, error: Error) {
        let _ = conn;
        warn!("unhandled message exception: {}", error);
    }
}

/// Length-prefixed framing over any connection.
///
/// Each message travels as a 4-byte big-endian length followed by that
/// many payload bytes. The length value `0xFFFF_FFFF` is reserved for a
/// NULL message, emitted with [`Sized::write_null`] (or a `None`
/// element in [`Sized::writelines`]) and delivered to the receiver as
/// an explicit `handle_message(conn, None)`.
///
/// The adapter mirrors the connection surface (`write`, `writelines`,
/// `close`, `peer_address`, `is_open`, `set_handler`), but its inbound
/// unit is an `Option<frame>` rather than a byte chunk, so its handler
/// is a [`MessageHandler`].
pub struct Sized<C: Conn> {
    inner: Arc<SizedInner<C>>,
}

struct SizedInner<C: Conn> {
    conn: C,
    state: Mutex<SizedState<C>>,
}

struct SizedState<C: Conn> {
    buffer: Vec<u8>,
    want: usize,
    reading_size: bool,
    handler: Option<Box<dyn MessageHandler<Sized<C>>>>,
}

impl<C: Conn> Sized<C> {
    pub fn new(conn: C) -> Sized<C> {
        Sized {
            inner: Arc::new(SizedInner {
                conn,
                state: Mutex::new(SizedState {
                    buffer: Vec::new(),
                    want: 4,
                    reading_size: true,
                    handler: None,
                }),
            }),
        }
    }

    /// The wrapped connection.
    pub fn connection(&self) -> &C {
        &self.inner.conn
    }

    pub fn set_handler<H>(&self, handler: H) -> Result<(), Error>
    where
        H: MessageHandler<Sized<C>> + 'static,
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
        self.inner.conn.set_handler(SizedDispatch {
            adapter: self.clone(),
        })
    }

    /// Queues one message as `length || payload`.
    pub fn write<B>(&self, message: B) -> Result<(), Error>
    where
        B: AsRef<[u8]>,
    {
        let message = message.as_ref();
        let mut frame = Vec::with_capacity(4 + message.len());
        frame.extend_from_slice(&(message.len() as u32).to_be_bytes());
        frame.extend_from_slice(message);
        self.inner.conn.write(frame)
    }

    /// Queues a NULL message.
    pub fn write_null(&self) -> Result<(), Error> {
        self.inner.conn.write(NULL_MARKER.to_vec())
    }

    /// Queues a lazy sequence of messages, each framed as
    /// `length || payload`, with `None` elements sent as NULL markers.
    pub fn writelines<I>(&self, messages: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = Option<Vec<u8>>>,
        I::IntoIter: Send + 'static,
    {
        self.inner
            .conn
            .writelines(messages.into_iter().map(|message| Ok(frame_for(message))))
    }

    pub fn close(&self) {
        self.inner.conn.close()
    }

    pub fn peer_address(&self) -> Address {
        self.inner.conn.peer_address()
    }

    pub fn is_open(&self) -> bool {
        self.inner.conn.is_open()
    }
}

impl<C: Conn> Clone for Sized<C> {
    fn clone(&self) -> Sized<C> {
        Sized {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn frame_for(message: Option<Vec<u8>>) -> Vec<u8> {
    match message {
        None => NULL_MARKER.to_vec(),
        Some(payload) => {
            let mut frame = Vec::with_capacity(4 + payload.len());
            frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            frame.extend_from_slice(&payload);
            frame
        }
    }
}

/// The handler the adapter binds on the wrapped connection.
struct SizedDispatch<C: Conn> {
    adapter: Sized<C>,
}

impl<C: Conn> ConnectionHandler<C> for SizedDispatch<C> {
    fn handle_input(&mut self, _conn: &C, data: &[u8]) {
        let mut st = self.adapter.inner.state.lock();
        st.buffer.extend_from_slice(data);
        loop {
            if st.buffer.len() < st.want {
                break;
            }
            let want = st.want;
            let frame: Vec<u8> = st.buffer.drain(..want).collect();
            if st.reading_size {
                if frame == NULL_MARKER {
                    let SizedState { handler, .. } = &mut *st;
                    if let Some(handler) = handler.as_mut() {
                        handler.handle_message(&self.adapter, None);
                    }
                    continue;
                }
                st.want = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
                st.reading_size = false;
            } else {
                st.want = 4;
                st.reading_size = true;
                let SizedState { handler, .. } = &mut *st;
                if let Some(handler) = handler.as_mut() {
                    handler.handle_message(&self.adapter, Some(&frame));
                }
            }
        }
    }

    fn handle_close(&mut self, _conn: &C, reason: &str) {
        let mut st = self.adapter.inner.state.lock();
        let SizedState { handler, .. } = &mut *st;
        if let Some(handler) = handler.as_mut() {
            handler.handle_close(&self.adapter, reason);
        }
    }

    fn handle_exception(&mut self, _conn: &C, error: Error) {
        let mut st = self.adapter.inner.state.lock();
        let SizedState { handler, .. } = &mut *st;
        if let Some(handler) = handler.as_mut() {
            handler.handle_exception(&self.adapter, error);
        }
    }
}
