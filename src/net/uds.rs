use std::io;
use std::os::unix::net::{SocketAddr, UnixDatagram, UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use crate::net::Address;
use crate::sys::net::{self as sys_net, Progress};

/// Unix socket addresses are filesystem paths; unnamed and abstract
/// peers collapse to an empty path.
pub(crate) fn to_address(addr: &SocketAddr) -> Address {
    match addr.as_pathname() {
        Some(path) => Address::Unix(path.to_path_buf()),
        None => Address::Unix(PathBuf::new()),
    }
}

pub(crate) fn connect(path: &Path) -> io::Result<(UnixStream, Progress)> {
    sys_net::unix_connect(path)
}

pub(crate) fn connect_again(stream: &UnixStream, path: &Path) -> io::Result<Progress> {
    sys_net::unix_connect_again(stream, path)
}

pub(crate) fn bind(path: &Path) -> io::Result<UnixListener> {
    sys_net::bind_unix_listener(path)
}

pub(crate) fn accept(listener: &UnixListener) -> io::Result<(UnixStream, SocketAddr)> {
    let (stream, addr) = listener.accept()?;
    stream.set_nonblocking(true)?;
    Ok((stream, addr))
}

pub(crate) fn bind_datagram(path: &Path) -> io::Result<UnixDatagram> {
    sys_net::bind_unix_datagram(path)
}

pub(crate) fn unbound_datagram() -> io::Result<UnixDatagram> {
    let socket = UnixDatagram::unbound()?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
