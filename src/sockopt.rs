//! Shared socket construction helpers: `SO_REUSEADDR`/`SO_REUSEPORT` and
//! `IPV6_V6ONLY` handling, used identically by the Listener, UdpEndpoint and
//! HolePuncher so all three can share one local port (§5, "Shared
//! resources").

use socket2::{Domain, Protocol, Socket, Type};
use std::io;

use crate::endpoint::Family;

fn domain_of(family: Family) -> Domain {
    match family {
        Family::V4 => Domain::IPV4,
        Family::V6 => Domain::IPV6,
    }
}

/// Set `SO_REUSEADDR` (always) and `SO_REUSEPORT` (best-effort, unix only —
/// the option doesn't exist everywhere and its absence must be ignored, not
/// treated as an error).
fn make_reusable(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    {
        if let Err(err) = socket.set_reuse_port(true) {
            tracing::debug!("SO_REUSEPORT unavailable, continuing without it: {err}");
        }
    }
    Ok(())
}

/// Clear `IPV6_V6ONLY` on a V6 socket so it accepts IPv4-mapped traffic too
/// (dual-stack). A no-op for V4 sockets.
fn clear_v6_only(socket: &Socket, family: Family) -> io::Result<()> {
    if family == Family::V6 {
        socket.set_only_v6(false)?;
    }
    Ok(())
}

/// Build a stream (TCP) socket bound to `port` on the wildcard address,
/// with port reuse and dual-stack enabled, but neither listening nor
/// connected. Used by both the Listener (which then calls `listen`) and the
/// HolePuncher (which then calls `connect`).
pub fn bind_stream_socket(family: Family, port: u16) -> io::Result<Socket> {
    let socket = Socket::new(domain_of(family), Type::STREAM, Some(Protocol::TCP))?;
    clear_v6_only(&socket, family)?;
    make_reusable(&socket)?;
    let bind_addr = wildcard_addr(family, port);
    socket.bind(&bind_addr.into())?;
    Ok(socket)
}

/// Build a datagram (UDP) socket bound to `port` on the wildcard address,
/// with port reuse and dual-stack enabled.
pub fn bind_dgram_socket(family: Family, port: u16) -> io::Result<Socket> {
    let socket = Socket::new(domain_of(family), Type::DGRAM, Some(Protocol::UDP))?;
    clear_v6_only(&socket, family)?;
    make_reusable(&socket)?;
    let bind_addr = wildcard_addr(family, port);
    socket.bind(&bind_addr.into())?;
    Ok(socket)
}

fn wildcard_addr(family: Family, port: u16) -> std::net::SocketAddr {
    match family {
        Family::V4 => std::net::SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port),
        Family::V6 => std::net::SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), port),
    }
}
