// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Multicast group resolution and socket setup.
//!
//! Group names resolve via DNS first; when that fails the group address is
//! derived deterministically from an FNV-1 hash of the host label, mapped
//! into 239/8, so this process and the radio back end agree on an address
//! without coordination.
//!
//! Outbound sockets have the interface pinned before the first send and do
//! not rely on the routing table. Receive sockets bind the group address
//! itself so unrelated traffic on the same port is filtered by the kernel.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

const FNV1_OFFSET: u32 = 0x811c_9dc5;
const FNV1_PRIME: u32 = 0x0100_0193;

#[derive(Debug, Error)]
pub enum MulticastError {
    #[error("invalid multicast group spec '{0}' (want host:port)")]
    BadSpec(String),
    #[error("interface '{0}' not found")]
    InterfaceNotFound(String),
    #[error("interface '{0}' has no IPv4 address")]
    NoIpv4Address(String),
    #[error("{op}: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("multicast endpoints are only supported on unix hosts")]
    Unsupported,
}

fn sockerr(op: &'static str) -> impl FnOnce(io::Error) -> MulticastError {
    move |source| MulticastError::Socket { op, source }
}

/// FNV-1 (not 1a) 32-bit hash.
pub fn fnv1_32(s: &str) -> u32 {
    s.bytes().fold(FNV1_OFFSET, |h, b| {
        h.wrapping_mul(FNV1_PRIME) ^ u32::from(b)
    })
}

/// Map a hash into 239/8, avoiding the ranges whose Ethernet MAC mapping
/// collides with 224.0.0.0/24 (switches exempt those from IGMP snooping).
/// The MAC mapping keeps only the low 23 bits of the address.
fn splice_mac_collision(addr: u32) -> u32 {
    if addr & 0x007f_ff00 == 0 {
        addr | (addr & 0xff) << 16 | (addr & 0xff) << 8
    } else {
        addr
    }
}

/// Deterministic group address for a host label that DNS cannot resolve.
pub fn hashed_group(host: &str) -> Ipv4Addr {
    let addr = splice_mac_collision(0xEF00_0000 | (fnv1_32(host) & 0x00FF_FFFF));
    Ipv4Addr::from(addr.to_be_bytes())
}

/// Resolve a `<host>:<port>` group spec: literal address, then DNS A
/// record, then the FNV-1 hash fallback.
pub fn resolve_group(spec: &str) -> Result<SocketAddrV4, MulticastError> {
    let (host, port) = spec
        .rsplit_once(':')
        .ok_or_else(|| MulticastError::BadSpec(spec.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| MulticastError::BadSpec(spec.to_string()))?;
    if host.is_empty() {
        return Err(MulticastError::BadSpec(spec.to_string()));
    }

    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(addr, port));
    }

    match (host, port).to_socket_addrs() {
        Ok(addrs) => {
            for addr in addrs {
                if let SocketAddr::V4(v4) = addr {
                    return Ok(v4);
                }
            }
        }
        Err(e) => {
            debug!("DNS lookup for {} failed ({}), deriving group by hash", host, e);
        }
    }

    Ok(SocketAddrV4::new(hashed_group(host), port))
}

/// An IPv4 interface resolved once at startup.
#[derive(Debug, Clone, Copy)]
pub struct Interface {
    pub index: u32,
    pub addr: Ipv4Addr,
}

#[cfg(unix)]
pub fn resolve_interface(name: &str) -> Result<Interface, MulticastError> {
    use std::ffi::CString;

    let c_name =
        CString::new(name).map_err(|_| MulticastError::InterfaceNotFound(name.to_string()))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(MulticastError::InterfaceNotFound(name.to_string()));
    }
    let addr = interface_ipv4(name)?.ok_or_else(|| MulticastError::NoIpv4Address(name.to_string()))?;
    Ok(Interface { index, addr })
}

#[cfg(not(unix))]
pub fn resolve_interface(_name: &str) -> Result<Interface, MulticastError> {
    Err(MulticastError::Unsupported)
}

/// First IPv4 address of the named interface via getifaddrs.
#[cfg(unix)]
fn interface_ipv4(name: &str) -> Result<Option<Ipv4Addr>, MulticastError> {
    use std::ffi::CStr;
    use std::ptr::null_mut;

    unsafe {
        let mut addrs: *mut libc::ifaddrs = null_mut();
        if libc::getifaddrs(&mut addrs) != 0 {
            return Err(MulticastError::Socket {
                op: "getifaddrs",
                source: io::Error::last_os_error(),
            });
        }
        let mut found = None;
        let mut current = addrs;
        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                let ifa_name = CStr::from_ptr(ifa.ifa_name).to_str().unwrap_or("");
                if ifa_name == name
                    && (*ifa.ifa_addr).sa_family == libc::AF_INET as libc::sa_family_t
                {
                    let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
                    break;
                }
            }
            current = ifa.ifa_next;
        }
        libc::freeifaddrs(addrs);
        Ok(found)
    }
}

/// Join `group` on the interface with the given index. Linux joins by
/// index via `ip_mreqn`; elsewhere the interface address is used.
fn join_on(socket: &Socket, group: Ipv4Addr, iface: &Interface) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::mem::size_of;
        use std::os::unix::io::AsRawFd;

        let mreq = libc::ip_mreqn {
            imr_multiaddr: libc::in_addr {
                s_addr: u32::from(group).to_be(),
            },
            imr_address: libc::in_addr { s_addr: 0 },
            imr_ifindex: iface.index as libc::c_int,
        };
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_ADD_MEMBERSHIP,
                &mreq as *const _ as *const libc::c_void,
                size_of::<libc::ip_mreqn>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    socket.join_multicast_v4(&group, &iface.addr)
}

fn join_loopback(socket: &Socket, group: Ipv4Addr) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let lo = resolve_interface("lo").map_err(|e| io::Error::other(e.to_string()))?;
        return join_on(socket, group, &lo);
    }
    #[cfg(not(target_os = "linux"))]
    socket.join_multicast_v4(&group, &Ipv4Addr::LOCALHOST)
}

/// Pin the outbound multicast interface, by index where the platform
/// allows it. Sends must never fall back to the routing table.
fn pin_outbound(socket: &Socket, iface: &Interface) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::mem::size_of;
        use std::os::unix::io::AsRawFd;

        let mreq = libc::ip_mreqn {
            imr_multiaddr: libc::in_addr { s_addr: 0 },
            imr_address: libc::in_addr { s_addr: 0 },
            imr_ifindex: iface.index as libc::c_int,
        };
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_MULTICAST_IF,
                &mreq as *const _ as *const libc::c_void,
                size_of::<libc::ip_mreqn>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    socket.set_multicast_if_v4(&iface.addr)
}

fn new_udp_socket() -> Result<Socket, MulticastError> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(sockerr("socket"))?;
    // Dropping beats blocking the real-time pipeline.
    socket.set_nonblocking(true).map_err(sockerr("set_nonblocking"))?;
    Ok(socket)
}

/// Open the command/send socket for a group: ephemeral local port,
/// loop-on so co-located receivers hear us, TTL 1 (locally scoped),
/// outbound interface pinned. Sends go through `send_to` because the
/// socket stays unconnected.
pub fn open_send(group: SocketAddrV4, iface: &Interface) -> Result<UdpSocket, MulticastError> {
    let socket = new_udp_socket()?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(sockerr("IP_MULTICAST_LOOP"))?;
    socket
        .set_multicast_ttl_v4(1)
        .map_err(sockerr("IP_MULTICAST_TTL"))?;
    pin_outbound(&socket, iface).map_err(sockerr("IP_MULTICAST_IF"))?;
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
        .map_err(sockerr("bind"))?;
    if let Err(e) = join_on(&socket, *group.ip(), iface) {
        warn!("join {} on interface index {} failed: {}", group.ip(), iface.index, e);
    }
    if let Err(e) = join_loopback(&socket, *group.ip()) {
        warn!("join {} on loopback failed: {}", group.ip(), e);
    }
    UdpSocket::from_std(socket.into()).map_err(sockerr("register with reactor"))
}

/// Open a receive socket for a group: bound to the group address and
/// port, joined on the chosen interface (required) and on loopback
/// (tolerated).
pub fn open_recv(group: SocketAddrV4, iface: &Interface) -> Result<UdpSocket, MulticastError> {
    let socket = new_udp_socket()?;
    socket
        .set_reuse_address(true)
        .map_err(sockerr("SO_REUSEADDR"))?;
    socket.bind(&group.into()).map_err(sockerr("bind group"))?;
    join_on(&socket, *group.ip(), iface).map_err(sockerr("IP_ADD_MEMBERSHIP"))?;
    if let Err(e) = join_loopback(&socket, *group.ip()) {
        warn!("join {} on loopback failed: {}", group.ip(), e);
    }
    UdpSocket::from_std(socket.into()).map_err(sockerr("register with reactor"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1_reference_vector() {
        // FNV-1 of the empty string is the offset basis.
        assert_eq!(fnv1_32(""), 0x811c_9dc5);
        assert_eq!(fnv1_32("ka9q-radio-status.local"), 0x4a2a_5793);
    }

    #[test]
    fn test_hashed_group_is_admin_scoped() {
        let addr = hashed_group("ka9q-radio-status.local");
        assert_eq!(addr, Ipv4Addr::new(239, 42, 87, 147));
        assert_eq!(addr.octets()[0], 239);
    }

    #[test]
    fn test_resolve_unresolvable_name_falls_back_to_hash() {
        let group = resolve_group("ka9q-radio-status.invalid:5006").unwrap();
        assert_eq!(group.port(), 5006);
        assert_eq!(group.ip().octets()[0], 239);
        // Must not land in 239.0.0.0/24.
        assert_ne!(group.ip().octets()[1], 0);
    }

    #[test]
    fn test_splice_escapes_mac_collision_ranges() {
        // 239.0.0.66 maps to the same MAC as 224.0.0.66; the low byte is
        // spliced into the middle bytes.
        let spliced = splice_mac_collision(0xEF00_0042);
        assert_eq!(Ipv4Addr::from(spliced.to_be_bytes()), Ipv4Addr::new(239, 66, 66, 66));
        // 239.128.0.1 collides as well: the MAC mapping ignores the top
        // bit of the second octet.
        let spliced = splice_mac_collision(0xEF80_0001);
        assert_ne!(spliced & 0x007f_ff00, 0);
        // Addresses outside the collision ranges pass through.
        assert_eq!(splice_mac_collision(0xEF2A_5793), 0xEF2A_5793);
    }

    #[test]
    fn test_resolve_literal_address() {
        let group = resolve_group("239.1.2.3:5004").unwrap();
        assert_eq!(*group.ip(), Ipv4Addr::new(239, 1, 2, 3));
        assert_eq!(group.port(), 5004);
    }

    #[test]
    fn test_resolve_rejects_bad_specs() {
        assert!(resolve_group("no-port").is_err());
        assert!(resolve_group(":5004").is_err());
        assert!(resolve_group("host:notaport").is_err());
    }
}
