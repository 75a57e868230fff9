use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::event::Events;
use crate::interest::Interest;
use crate::sys;
use crate::token::Token;

/// Polls for readiness events on all registered endpoints.
///
/// One `Poll` exists per reactor and outlives individual runs of the
/// selector loop; endpoints keep `Registry` clones so interest can be
/// adjusted from any thread.
pub(crate) struct Poll {
    registry: Registry,
}

/// Registers endpoints with the reactor's selector.
#[derive(Clone)]
pub(crate) struct Registry {
    selector: Arc<sys::Selector>,
}

impl Poll {
    pub(crate) fn new() -> io::Result<Poll> {
        sys::Selector::new().map(|selector| Poll {
            registry: Registry {
                selector: Arc::new(selector),
            },
        })
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Blocks until a registered endpoint is ready or the timeout
    /// elapses. `Interrupted` is surfaced to the caller; the selector
    /// loop retries it.
    pub(crate) fn poll(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.registry.selector.select(events.sys(), timeout)
    }
}

impl Registry {
    pub(crate) fn register(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        trace!("registering fd {} with {:?}, {:?}", fd, token, interest);
        self.selector.register(fd, token, interest)
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        trace!("reregistering fd {} with {:?}, {:?}", fd, token, interest);
        self.selector.reregister(fd, token, interest)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        trace!("deregistering fd {}", fd);
        self.selector.deregister(fd)
    }
}

/// Tracks one endpoint's registration with the selector.
///
/// The wanted interest is derived from endpoint state (handler bound,
/// output pending, closed); `ensure` applies the difference between that
/// and what the selector currently knows. An endpoint wanting nothing is
/// deregistered, not parked with an empty interest, so that error
/// conditions on an idle socket cannot spin the loop.
pub(crate) struct Registration {
    registry: Registry,
    token: Token,
    fd: RawFd,
    active: Option<Interest>,
}

impl Registration {
    pub(crate) fn new(registry: Registry, token: Token, fd: RawFd) -> Registration {
        Registration {
            registry,
            token,
            fd,
            active: None,
        }
    }

    pub(crate) fn ensure(&mut self, want: Option<Interest>) -> io::Result<()> {
        match (self.active, want) {
            (None, Some(interest)) => self.registry.register(self.fd, self.token, interest)?,
            (Some(active), Some(interest)) if active != interest => {
                self.registry.reregister(self.fd, self.token, interest)?
            }
            (Some(_), None) => self.registry.deregister(self.fd)?,
            _ => return Ok(()),
        }
        self.active = want;
        Ok(())
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.active.is_some() {
            let _ = self.registry.deregister(self.fd);
        }
    }
}
