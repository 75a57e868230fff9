use std::io;
use std::net::{self, SocketAddr};

use crate::sys::net as sys_net;

pub(crate) fn bind(addr: SocketAddr) -> io::Result<net::UdpSocket> {
    sys_net::bind_udp(addr)
}

/// A socket suitable for sending towards `dest` without binding to a
/// fixed local port; the kernel picks one on first send.
pub(crate) fn unbound(dest: SocketAddr) -> io::Result<net::UdpSocket> {
    let local: SocketAddr = if dest.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    sys_net::bind_udp(local)
}
