use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use crate::interest::Interest;
use crate::poll::Registry;
use crate::sys;
use crate::token::Token;

/// Allows any thread to unblock the selector loop.
///
/// `wake` is thread-safe and idempotent: concurrent pulses coalesce into
/// at most one extra wakeup, because the loop drains the pipe once per
/// readiness event. `close` is only called from the selector thread
/// during teardown; the loop recreates the waker if it finds it closed
/// while still running.
pub(crate) struct Waker {
    inner: sys::Waker,
    registry: Registry,
    token: Token,
    closed: AtomicBool,
}

impl Waker {
    pub(crate) fn new(registry: &Registry, token: Token) -> io::Result<Waker> {
        let inner = sys::Waker::new()?;
        registry.register(inner.as_raw_fd(), token, Interest::READABLE)?;
        Ok(Waker {
            inner,
            registry: registry.clone(),
            token,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn wake(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.inner.wake() {
            warn!("failed to wake selector ({:?}): {}", self.token, err);
        }
    }

    pub(crate) fn drain(&self) {
        self.inner.drain();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.registry.deregister(self.inner.as_raw_fd());
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        self.close();
    }
}
