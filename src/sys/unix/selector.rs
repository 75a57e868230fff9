use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::interest::Interest;
use crate::token::Token;

/// An `epoll(7)` instance.
///
/// Registrations are level-triggered: the reactor recomputes the wanted
/// interest whenever connection state changes, so a readiness condition
/// that is not acted upon must keep being reported.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up to avoid
                // turning a sub-millisecond timeout into a busy loop.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis()
                    .min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
        ))
        .map(|n_events| {
            // SAFETY: `epoll_wait` ensures that `n_events` are assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: usize::from(token) as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::Event;
    use crate::token::Token;

    pub(crate) fn token(event: &Event) -> Token {
        Token(event.u64 as usize)
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLIN) != 0
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLOUT) != 0
    }

    pub(crate) fn is_error(event: &Event) -> bool {
        (event.events as libc::c_int & libc::EPOLLERR) != 0
    }

    pub(crate) fn is_read_closed(event: &Event) -> bool {
        // Both halves closed, or the peer sent a FIN.
        event.events as libc::c_int & libc::EPOLLHUP != 0
            || (event.events as libc::c_int & libc::EPOLLIN != 0
                && event.events as libc::c_int & libc::EPOLLRDHUP != 0)
    }
}
