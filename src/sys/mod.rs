//! Platform specific plumbing. Only unix-like systems with `epoll` are
//! supported; the `sys` split keeps everything that touches `libc` in
//! one place.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{errno_name, event, net, Event, Events, Selector, Waker};

#[cfg(not(unix))]
compile_error!("ngi only supports unix-like targets");
