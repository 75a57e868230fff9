//! Socket types used by the reactor.
//!
//! Everything here is non-blocking from creation. Streams, listeners and
//! datagram sockets each come in an IP and a unix-domain flavour, folded
//! into one enum per kind so the reactor and connections stay agnostic
//! of the address family.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::{fmt, net as std_net};

pub(crate) mod tcp;
pub(crate) mod udp;
pub(crate) mod uds;

pub(crate) use crate::sys::net::Progress;

/// Address of a network endpoint: an IP socket address or a unix-domain
/// socket path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl Address {
    /// Loopback with an OS-assigned port; the conventional "pick a port
    /// for me" listener address.
    pub fn local_any() -> Address {
        Address::Inet(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    /// Placeholder used where a transport has no meaningful address,
    /// e.g. the client side of an in-process test connection.
    pub fn unspecified() -> Address {
        Address::Inet(SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    /// The port of an IP address, if this is one.
    pub fn port(&self) -> Option<u16> {
        match self {
            Address::Inet(addr) => Some(addr.port()),
            Address::Unix(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(addr) => addr.fmt(fmt),
            Address::Unix(path) => path.display().fmt(fmt),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        Address::Inet(addr)
    }
}

impl From<(std_net::IpAddr, u16)> for Address {
    fn from(addr: (std_net::IpAddr, u16)) -> Address {
        Address::Inet(SocketAddr::from(addr))
    }
}

impl From<([u8; 4], u16)> for Address {
    fn from(addr: ([u8; 4], u16)) -> Address {
        Address::Inet(SocketAddr::from(addr))
    }
}

impl From<PathBuf> for Address {
    fn from(path: PathBuf) -> Address {
        Address::Unix(path)
    }
}

impl From<&Path> for Address {
    fn from(path: &Path) -> Address {
        Address::Unix(path.to_path_buf())
    }
}

/// A connected (or connecting) byte stream.
#[derive(Debug)]
pub(crate) enum StreamSocket {
    Tcp(std_net::TcpStream),
    Unix(UnixStream),
}

impl StreamSocket {
    /// Starts a non-blocking connect towards `addr`.
    pub(crate) fn connect(addr: &Address) -> io::Result<(StreamSocket, Progress)> {
        match addr {
            Address::Inet(addr) => {
                tcp::connect(*addr).map(|(s, p)| (StreamSocket::Tcp(s), p))
            }
            Address::Unix(path) => {
                uds::connect(path).map(|(s, p)| (StreamSocket::Unix(s), p))
            }
        }
    }

    /// Re-drives an in-progress connect after write readiness.
    pub(crate) fn connect_again(&self, addr: &Address) -> io::Result<Progress> {
        match (self, addr) {
            (StreamSocket::Tcp(s), Address::Inet(addr)) => tcp::connect_again(s, *addr),
            (StreamSocket::Unix(s), Address::Unix(path)) => uds::connect_again(s, path),
            _ => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamSocket::Tcp(s) => s.read(buf),
            StreamSocket::Unix(s) => s.read(buf),
        }
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamSocket::Tcp(s) => s.write(buf),
            StreamSocket::Unix(s) => s.write(buf),
        }
    }

    pub(crate) fn peer_addr(&self) -> io::Result<Address> {
        match self {
            StreamSocket::Tcp(s) => s.peer_addr().map(Address::Inet),
            StreamSocket::Unix(s) => s.peer_addr().map(|addr| uds::to_address(&addr)),
        }
    }
}

impl AsRawFd for StreamSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            StreamSocket::Tcp(s) => s.as_raw_fd(),
            StreamSocket::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// A bound, listening stream socket.
#[derive(Debug)]
pub(crate) enum ListenSocket {
    Tcp(std_net::TcpListener),
    Unix(UnixListener),
}

impl ListenSocket {
    pub(crate) fn bind(addr: &Address) -> io::Result<ListenSocket> {
        match addr {
            Address::Inet(addr) => tcp::bind(*addr).map(ListenSocket::Tcp),
            Address::Unix(path) => uds::bind(path).map(ListenSocket::Unix),
        }
    }

    /// Accepts one pending connection; the returned stream is already
    /// non-blocking.
    pub(crate) fn accept(&self) -> io::Result<(StreamSocket, Address)> {
        match self {
            ListenSocket::Tcp(l) => {
                tcp::accept(l).map(|(s, a)| (StreamSocket::Tcp(s), Address::Inet(a)))
            }
            ListenSocket::Unix(l) => {
                uds::accept(l).map(|(s, a)| (StreamSocket::Unix(s), uds::to_address(&a)))
            }
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<Address> {
        match self {
            ListenSocket::Tcp(l) => l.local_addr().map(Address::Inet),
            ListenSocket::Unix(l) => l.local_addr().map(|addr| uds::to_address(&addr)),
        }
    }
}

impl AsRawFd for ListenSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            ListenSocket::Tcp(l) => l.as_raw_fd(),
            ListenSocket::Unix(l) => l.as_raw_fd(),
        }
    }
}

/// A datagram socket, bound (listeners) or unbound (the send pool).
#[derive(Debug)]
pub(crate) enum DatagramSocket {
    Udp(std_net::UdpSocket),
    Unix(UnixDatagram),
}

impl DatagramSocket {
    pub(crate) fn bind(addr: &Address) -> io::Result<DatagramSocket> {
        match addr {
            Address::Inet(addr) => udp::bind(*addr).map(DatagramSocket::Udp),
            Address::Unix(path) => uds::bind_datagram(path).map(DatagramSocket::Unix),
        }
    }

    /// An unbound socket able to send towards `addr`'s family.
    pub(crate) fn unbound_for(addr: &Address) -> io::Result<DatagramSocket> {
        match addr {
            Address::Inet(addr) => udp::unbound(*addr).map(DatagramSocket::Udp),
            Address::Unix(_) => uds::unbound_datagram().map(DatagramSocket::Unix),
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<Address> {
        match self {
            DatagramSocket::Udp(s) => s.local_addr().map(Address::Inet),
            DatagramSocket::Unix(s) => s.local_addr().map(|addr| uds::to_address(&addr)),
        }
    }

    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)> {
        match self {
            DatagramSocket::Udp(s) => s.recv_from(buf).map(|(n, a)| (n, Address::Inet(a))),
            DatagramSocket::Unix(s) => {
                s.recv_from(buf).map(|(n, a)| (n, uds::to_address(&a)))
            }
        }
    }

    pub(crate) fn send_to(&self, buf: &[u8], addr: &Address) -> io::Result<usize> {
        match (self, addr) {
            (DatagramSocket::Udp(s), Address::Inet(addr)) => s.send_to(buf, addr),
            (DatagramSocket::Unix(s), Address::Unix(path)) => s.send_to(buf, path),
            _ => Err(io::ErrorKind::InvalidInput.into()),
        }
    }
}

impl AsRawFd for DatagramSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            DatagramSocket::Udp(s) => s.as_raw_fd(),
            DatagramSocket::Unix(s) => s.as_raw_fd(),
        }
    }
}
