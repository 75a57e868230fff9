use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Wakeup backed by a unix pipe.
///
/// The read end is registered with the selector; writing a byte to the
/// write end unblocks a pending `epoll_wait`. A full pipe means a wakeup
/// is already pending, so `WouldBlock` counts as success.
#[derive(Debug)]
pub(crate) struct Waker {
    sender: File,
    receiver: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let mut fds = [-1; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
        // SAFETY: `pipe2(2)` ensures the fds are valid.
        let receiver = unsafe { File::from_raw_fd(fds[0]) };
        let sender = unsafe { File::from_raw_fd(fds[1]) };
        Ok(Waker { sender, receiver })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// Empty the pipe's buffer. Called by the selector loop after a
    /// wakeup so pulses coalesce instead of accumulating.
    pub(crate) fn drain(&self) {
        let mut buf = [0; 4096];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}
