//! Listening and per-session socket construction.
//!
//! Listening sockets are built through `socket2` for the bind-time knobs
//! (`SO_REUSEADDR`, explicit domain selection) then handed to Tokio, the
//! way the rest of this lineage wires `socket2::Socket` into
//! `tokio::net::UdpSocket`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{Result, TftpError};

pub const TFTP_PORT: u16 = 69;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// An interface-bound address resolved by [`resolve_interface_address`].
/// `scope_id` is the interface index and is only meaningful (non-zero)
/// for IPv6 link-local addresses, where `bind(2)` needs it to disambiguate
/// which link `fe80::/10` refers to — the numeric equivalent of appending
/// `%ifname` to the address string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub ip: IpAddr,
    pub scope_id: u32,
}

impl InterfaceAddr {
    fn socket_addr(&self, port: u16) -> SocketAddr {
        match self.ip {
            IpAddr::V4(ip) => SocketAddr::new(IpAddr::V4(ip), port),
            IpAddr::V6(ip) => SocketAddr::V6(SocketAddrV6::new(ip, port, 0, self.scope_id)),
        }
    }
}

/// Builds a UDP socket bound to `addr`, tuned with `SO_REUSEADDR` and
/// handed off to the current Tokio runtime in non-blocking mode.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TftpError::Tftp(format!("failed to create socket: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| TftpError::Tftp(format!("failed to set SO_REUSEADDR: {e}")))?;
    socket
        .bind(&addr.into())
        .map_err(|e| TftpError::Tftp(format!("failed to bind to {addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TftpError::Tftp(format!("failed to set non-blocking: {e}")))?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|e| TftpError::Tftp(format!("failed to adopt socket into runtime: {e}")))
}

/// Binds one of the server's two listening sockets (port 69) for the
/// given family, optionally restricted to a single interface's address.
pub fn bind_listener(family: Family, iface_addr: Option<InterfaceAddr>) -> Result<UdpSocket> {
    let addr = match iface_addr {
        Some(iface) => iface.socket_addr(TFTP_PORT),
        None => {
            let ip = match family {
                Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            SocketAddr::new(ip, TFTP_PORT)
        }
    };
    bind_udp(addr)
}

/// Binds a per-session socket on the same address family and local IP
/// as the listener that received the request, with an ephemeral port.
pub fn bind_session_socket(local_ip: IpAddr) -> Result<UdpSocket> {
    bind_udp(SocketAddr::new(local_ip, 0))
}

/// Looks up the address of `ifname` for the requested family using the
/// system's interface address list. For IPv6 this carries the
/// interface's scope id along, since a link-local address alone isn't
/// enough for `bind(2)` to pick the right link.
pub fn resolve_interface_address(ifname: &str, family: Family) -> Result<InterfaceAddr> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| TftpError::Tftp(format!("failed to enumerate interfaces: {e}")))?;
    for ifaddr in addrs {
        if ifaddr.interface_name != ifname {
            continue;
        }
        let Some(address) = ifaddr.address else { continue };
        if let Some(sin) = address.as_sockaddr_in() {
            if family == Family::V4 {
                return Ok(InterfaceAddr { ip: IpAddr::V4(Ipv4Addr::from(sin.ip())), scope_id: 0 });
            }
        }
        if let Some(sin6) = address.as_sockaddr_in6() {
            if family == Family::V6 {
                return Ok(InterfaceAddr { ip: IpAddr::V6(sin6.ip()), scope_id: sin6.scope_id() });
            }
        }
    }
    Err(TftpError::Tftp(format!(
        "interface {ifname} has no address for the requested family"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_udp_picks_ephemeral_port_on_loopback() {
        let socket = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn interface_addr_carries_scope_id_into_v6_socket_addr() {
        let iface = InterfaceAddr { ip: IpAddr::V6("fe80::1".parse().unwrap()), scope_id: 3 };
        match iface.socket_addr(69) {
            SocketAddr::V6(addr) => assert_eq!(addr.scope_id(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn interface_addr_ignores_scope_id_for_v4() {
        let iface = InterfaceAddr { ip: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 5)), scope_id: 3 };
        assert_eq!(iface.socket_addr(69), "192.168.0.5:69".parse().unwrap());
    }
}
