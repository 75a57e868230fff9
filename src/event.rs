use std::fmt;

use crate::sys;
use crate::token::Token;

/// A readiness event delivered by the selector.
#[derive(Copy, Clone)]
pub(crate) struct Event {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
}

impl Event {
    fn from_sys(event: &sys::Event) -> Event {
        Event {
            token: sys::event::token(event),
            readable: sys::event::is_readable(event),
            writable: sys::event::is_writable(event),
            error: sys::event::is_error(event),
            read_closed: sys::event::is_read_closed(event),
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.readable
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn is_error(&self) -> bool {
        self.error
    }

    pub(crate) fn is_read_closed(&self) -> bool {
        self.read_closed
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Event")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("error", &self.error)
            .field("read_closed", &self.read_closed)
            .finish()
    }
}

/// A buffer of readiness events filled by one call to the selector.
pub(crate) struct Events {
    inner: sys::Events,
}

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter().map(Event::from_sys)
    }

    pub(crate) fn sys(&mut self) -> &mut sys::Events {
        &mut self.inner
    }
}
