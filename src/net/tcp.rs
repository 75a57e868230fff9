use std::io;
use std::net::{self, SocketAddr};

use crate::sys::net::{self as sys_net, Progress};

pub(crate) fn connect(addr: SocketAddr) -> io::Result<(net::TcpStream, Progress)> {
    sys_net::tcp_connect(addr)
}

pub(crate) fn connect_again(stream: &net::TcpStream, addr: SocketAddr) -> io::Result<Progress> {
    sys_net::tcp_connect_again(stream, addr)
}

/// Binds a listening socket with `SO_REUSEADDR` set and the
/// non-blocking flag applied at creation.
pub(crate) fn bind(addr: SocketAddr) -> io::Result<net::TcpListener> {
    sys_net::bind_tcp_listener(addr)
}

pub(crate) fn accept(listener: &net::TcpListener) -> io::Result<(net::TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept()?;
    stream.set_nonblocking(true)?;
    Ok((stream, addr))
}
