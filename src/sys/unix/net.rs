use std::io;
use std::mem;
use std::net::{self, SocketAddr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
use std::path::Path;

/// Backlog used by all listeners.
const LISTEN_BACKLOG: libc::c_int = 1024;

/// Outcome of a non-blocking `connect(2)` attempt.
///
/// Expected errno values are folded into the two non-error states:
/// `EINPROGRESS`, `EALREADY` and `EWOULDBLOCK` mean the connect is still
/// underway and should be retried on write readiness; `EISCONN` means a
/// redundant attempt on an already connected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Connected,
    InProgress,
}

fn new_socket(domain: libc::c_int, socket_type: libc::c_int) -> io::Result<RawFd> {
    syscall!(socket(
        domain,
        socket_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))
}

fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let yes: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &yes as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

/// A `sockaddr` large enough for either IP family, matching the layout
/// the kernel expects.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const _ as *const libc::sockaddr
    }
}

/// Converts a Rust `SocketAddr` into the system representation.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(ref addr) => {
            let sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };
            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr,
                sin_zero: [0; 8],
            };
            let sockaddr = SocketAddrCRepr { v4: sockaddr_in };
            (sockaddr, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(ref addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
            };
            let sockaddr = SocketAddrCRepr { v6: sockaddr_in6 };
            (sockaddr, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Converts a filesystem path into a `sockaddr_un`.
pub(crate) fn unix_addr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: a zeroed `sockaddr_un` is a valid value.
    let mut sockaddr = unsafe { mem::zeroed::<libc::sockaddr_un>() };
    sockaddr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // One byte is reserved for the trailing null.
    if bytes.len() >= sockaddr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path must be shorter than SUN_LEN",
        ));
    }
    for (dst, src) in sockaddr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let path_offset = {
        let base = &sockaddr as *const _ as usize;
        let path = &sockaddr.sun_path as *const _ as usize;
        path - base
    };
    let addrlen = path_offset + bytes.len() + 1;
    Ok((sockaddr, addrlen as libc::socklen_t))
}

fn connect_raw(
    fd: RawFd,
    sockaddr: *const libc::sockaddr,
    len: libc::socklen_t,
) -> io::Result<Progress> {
    match syscall!(connect(fd, sockaddr, len)) {
        Ok(_) => Ok(Progress::Connected),
        Err(err) => match err.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EAGAIN) => {
                Ok(Progress::InProgress)
            }
            Some(libc::EISCONN) => Ok(Progress::Connected),
            _ => Err(err),
        },
    }
}

pub(crate) fn tcp_connect(addr: SocketAddr) -> io::Result<(net::TcpStream, Progress)> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = new_socket(domain, libc::SOCK_STREAM)?;
    // SAFETY: `new_socket` ensures the fd is valid; the stream takes
    // ownership, so error paths below close it on drop.
    let stream = unsafe { net::TcpStream::from_raw_fd(fd) };
    let progress = tcp_connect_again(&stream, addr)?;
    Ok((stream, progress))
}

pub(crate) fn tcp_connect_again(stream: &net::TcpStream, addr: SocketAddr) -> io::Result<Progress> {
    let (sockaddr, len) = socket_addr(&addr);
    connect_raw(stream.as_raw_fd(), sockaddr.as_ptr(), len)
}

pub(crate) fn unix_connect(path: &Path) -> io::Result<(UnixStream, Progress)> {
    let fd = new_socket(libc::AF_UNIX, libc::SOCK_STREAM)?;
    // SAFETY: as for `tcp_connect`.
    let stream = unsafe { UnixStream::from_raw_fd(fd) };
    let progress = unix_connect_again(&stream, path)?;
    Ok((stream, progress))
}

pub(crate) fn unix_connect_again(stream: &UnixStream, path: &Path) -> io::Result<Progress> {
    let (sockaddr, len) = unix_addr(path)?;
    connect_raw(
        stream.as_raw_fd(),
        &sockaddr as *const _ as *const libc::sockaddr,
        len,
    )
}

pub(crate) fn bind_tcp_listener(addr: SocketAddr) -> io::Result<net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = new_socket(domain, libc::SOCK_STREAM)?;
    // SAFETY: `new_socket` ensures the fd is valid.
    let listener = unsafe { net::TcpListener::from_raw_fd(fd) };
    // Allows rebinding while the previous socket lingers in TIME_WAIT.
    set_reuseaddr(fd)?;
    let (sockaddr, len) = socket_addr(&addr);
    syscall!(bind(fd, sockaddr.as_ptr(), len))?;
    syscall!(listen(fd, LISTEN_BACKLOG))?;
    Ok(listener)
}

pub(crate) fn bind_unix_listener(path: &Path) -> io::Result<UnixListener> {
    let fd = new_socket(libc::AF_UNIX, libc::SOCK_STREAM)?;
    // SAFETY: `new_socket` ensures the fd is valid.
    let listener = unsafe { UnixListener::from_raw_fd(fd) };
    let (sockaddr, len) = unix_addr(path)?;
    syscall!(bind(fd, &sockaddr as *const _ as *const libc::sockaddr, len))?;
    syscall!(listen(fd, LISTEN_BACKLOG))?;
    Ok(listener)
}

pub(crate) fn bind_udp(addr: SocketAddr) -> io::Result<net::UdpSocket> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = new_socket(domain, libc::SOCK_DGRAM)?;
    // SAFETY: `new_socket` ensures the fd is valid.
    let socket = unsafe { net::UdpSocket::from_raw_fd(fd) };
    set_reuseaddr(fd)?;
    let (sockaddr, len) = socket_addr(&addr);
    syscall!(bind(fd, sockaddr.as_ptr(), len))?;
    Ok(socket)
}

pub(crate) fn bind_unix_datagram(path: &Path) -> io::Result<UnixDatagram> {
    let fd = new_socket(libc::AF_UNIX, libc::SOCK_DGRAM)?;
    // SAFETY: `new_socket` ensures the fd is valid.
    let socket = unsafe { UnixDatagram::from_raw_fd(fd) };
    let (sockaddr, len) = unix_addr(path)?;
    syscall!(bind(fd, &sockaddr as *const _ as *const libc::sockaddr, len))?;
    Ok(socket)
}

/// Symbolic name for the errno values a failed connect commonly reports.
/// Falls back to `None` for anything unlisted; callers then use the OS
/// error string instead.
pub(crate) fn errno_name(errno: i32) -> Option<&'static str> {
    Some(match errno {
        libc::EACCES => "EACCES",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
        libc::EAFNOSUPPORT => "EAFNOSUPPORT",
        libc::ECONNABORTED => "ECONNABORTED",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::ECONNRESET => "ECONNRESET",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        libc::EINVAL => "EINVAL",
        libc::ENETDOWN => "ENETDOWN",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::ENOENT => "ENOENT",
        libc::EPERM => "EPERM",
        libc::EPIPE => "EPIPE",
        libc::ETIMEDOUT => "ETIMEDOUT",
        _ => return None,
    })
}
