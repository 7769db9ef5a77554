//! Canonical, hashable representation of an (address, port) pair and the
//! family-aware resolution/canonicalization rules that make IPv4 and IPv6
//! spellings of the same host compare and hash equal.
//!
//! The Python source this was derived from stores endpoints as raw tuples
//! of strings and hand-rolls canonicalization because `str` equality is
//! spelling-sensitive (`"::1"` != `"0:0:0:0:0:0:0:1"`). Here the address
//! itself is a fixed-width [`Ipv4Addr`]/[`Ipv6Addr`], so two spellings of
//! one host already decode to the same bit pattern before canonicalization
//! ever runs; canonicalization is left to do only the part that is a real
//! semantic choice: family widening/narrowing of IPv4-mapped IPv6.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, TcpStream, ToSocketAddrs};

/// Which address family a [`Server`](crate::Server) operates in. Chosen once
/// at construction; every endpoint the Server produces or accepts is
/// canonicalized to this family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// An address-family-tagged (host, port) pair, hashable and
/// equality-comparable, suitable as a dictionary key. See §3 (Data Model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    V4 {
        addr: Ipv4Addr,
        port: u16,
    },
    V6 {
        addr: Ipv6Addr,
        port: u16,
        flowinfo: u32,
        scope_id: u32,
    },
}

impl Endpoint {
    pub fn family(&self) -> Family {
        match self {
            Endpoint::V4 { .. } => Family::V4,
            Endpoint::V6 { .. } => Family::V6,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Endpoint::V4 { port, .. } => *port,
            Endpoint::V6 { port, .. } => *port,
        }
    }

    /// A plain [`SocketAddr`] usable to bind/connect/send. Flowinfo and
    /// scope-id are preserved for V6; nothing is lost going the other way
    /// because `canonicalize` reconstructs them from the kernel-reported
    /// address on the way back in.
    pub fn to_socket_addr(&self) -> SocketAddr {
        match *self {
            Endpoint::V4 { addr, port } => SocketAddr::new(IpAddr::V4(addr), port),
            Endpoint::V6 {
                addr,
                port,
                flowinfo,
                scope_id,
            } => SocketAddr::V6(SocketAddrV6::new(addr, port, flowinfo, scope_id)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::V4 { addr, port } => write!(f, "{addr}:{port}"),
            Endpoint::V6 { addr, port, .. } => write!(f, "[{addr}]:{port}"),
        }
    }
}

/// Canonicalize a kernel-reported or user-supplied socket address into the
/// given family.
///
/// For `family = V6`, a V4 input is widened to `::ffff:a.b.c.d`. For
/// `family = V4`, a V6 input is narrowed if it is IPv4-mapped; any other V6
/// address is "not representable" in V4 and returns `None`. This is a
/// sentinel, not an error: callers that resolve an endpoint "not
/// representable" in the Server's configured family silently treat the
/// caller-visible operation (`hole_punch`, `stop_hole_punch`, ...) as a
/// no-op, per §7.
pub fn canonicalize(addr: SocketAddr, family: Family) -> Option<Endpoint> {
    match family {
        Family::V4 => match addr {
            SocketAddr::V4(v4) => Some(Endpoint::V4 {
                addr: *v4.ip(),
                port: v4.port(),
            }),
            SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().map(|v4| Endpoint::V4 {
                addr: v4,
                port: v6.port(),
            }),
        },
        Family::V6 => match addr {
            SocketAddr::V4(v4) => Some(Endpoint::V6 {
                addr: v4.ip().to_ipv6_mapped(),
                port: v4.port(),
                flowinfo: 0,
                scope_id: 0,
            }),
            SocketAddr::V6(v6) => Some(Endpoint::V6 {
                addr: *v6.ip(),
                port: v6.port(),
                flowinfo: v6.flowinfo(),
                scope_id: v6.scope_id(),
            }),
        },
    }
}

/// Resolve an unresolved `(host, port)` pair to one canonical [`Endpoint`]
/// in the given family.
///
/// In `V6` mode this falls back to a V4 answer (widened) when no V6 answer
/// is available, matching dual-stack behavior: a peer given by a
/// V4-only hostname is still reachable from a V6-bound Server. In `V4` mode
/// there is no fallback — a V6-only name is "resolution failed" for a V4
/// Server.
pub fn resolve(host: &str, port: u16, family: Family) -> Option<Endpoint> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs().ok()?.collect();

    match family {
        Family::V6 => {
            if let Some(v6) = addrs.iter().find(|a| a.is_ipv6()) {
                return canonicalize(*v6, Family::V6);
            }
            let v4 = addrs.iter().find(|a| a.is_ipv4())?;
            canonicalize(*v4, Family::V6)
        }
        Family::V4 => {
            let v4 = addrs.into_iter().find(|a| a.is_ipv4())?;
            canonicalize(v4, Family::V4)
        }
    }
}

/// Read a TCP stream's local name and canonicalize it.
pub fn local_endpoint_of(socket: &TcpStream, family: Family) -> Option<Endpoint> {
    canonicalize(socket.local_addr().ok()?, family)
}

/// Read a TCP stream's peer name and canonicalize it.
pub fn remote_endpoint_of(socket: &TcpStream, family: Family) -> Option<Endpoint> {
    canonicalize(socket.peer_addr().ok()?, family)
}
