//! The public entry point: owns the shared-port Listener, UdpEndpoint,
//! HolePuncher and ConnectionRegistry, and drives all of them from one
//! [`Server::tick`] call (§5).
//!
//! `tick` drains every component in a fixed order — each component
//! serializes its own background-thread-written state internally (the
//! HolePuncher's attempt table, the UdpEndpoint's keep-alive target set) and
//! hands the result back as a plain value — then, with nothing locked,
//! invokes the five callback categories in a fixed order: hole-punch
//! failures, connects, disconnects, unreliable receives, reliable receives.
//! A callback is therefore free to call back into the Server (e.g.
//! `hole_punch` a newly learned peer from inside `on_connect`) without
//! risking deadlock.

use std::io;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::connection::Connection;
use crate::endpoint::{self, canonicalize, local_endpoint_of, remote_endpoint_of, Endpoint, Family};
use crate::holepuncher::HolePuncher;
use crate::listener::Listener;
use crate::registry::ConnectionRegistry;
use crate::sockopt;
use crate::stun::StunClient;
use crate::udp::UdpEndpoint;

type HolePunchFailFn = Box<dyn FnMut(Endpoint) + Send>;
type ConnectFn = Box<dyn FnMut(Endpoint) + Send>;
type DisconnectFn = Box<dyn FnMut(Endpoint) + Send>;
type UnreliableReceiveFn = Box<dyn FnMut(Endpoint, Vec<u8>) + Send>;
type ReliableReceiveFn = Box<dyn FnMut(Endpoint, Vec<u8>) + Send>;

/// Built once per process and cloned per-Server; avoids re-allocating this
/// literal list on every `ServerConfig::new` call.
static DEFAULT_STUN_HOSTS: Lazy<Vec<(String, u16)>> = Lazy::new(|| {
    vec![
        ("stun.l.google.com".to_string(), 19302),
        ("stun1.l.google.com".to_string(), 19302),
        ("stun2.l.google.com".to_string(), 19302),
    ]
});

/// Typed construction surface for a [`Server`]. There is no file-backed
/// configuration format — this is an embedded library, not a standalone
/// process, so the caller builds a config value in code and supplies its
/// callbacks as closures.
pub struct ServerConfig {
    family: Family,
    port: u16,
    listen: bool,
    stun_hosts: Vec<(String, u16)>,
    on_hole_punch_fail: HolePunchFailFn,
    on_connect: ConnectFn,
    on_disconnect: DisconnectFn,
    on_unreliable_receive: UnreliableReceiveFn,
    on_reliable_receive: ReliableReceiveFn,
}

impl ServerConfig {
    /// `port = 0` asks the OS for an ephemeral port, shared afterward by the
    /// listener, UDP socket and every hole-punch dial socket.
    pub fn new(family: Family, port: u16) -> Self {
        Self {
            family,
            port,
            listen: true,
            stun_hosts: DEFAULT_STUN_HOSTS.clone(),
            on_hole_punch_fail: Box::new(|_| {}),
            on_connect: Box::new(|_| {}),
            on_disconnect: Box::new(|_| {}),
            on_unreliable_receive: Box::new(|_, _| {}),
            on_reliable_receive: Box::new(|_, _| {}),
        }
    }

    pub fn listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }

    pub fn stun_hosts(mut self, hosts: Vec<(String, u16)>) -> Self {
        self.stun_hosts = hosts;
        self
    }

    pub fn on_hole_punch_fail(mut self, f: impl FnMut(Endpoint) + Send + 'static) -> Self {
        self.on_hole_punch_fail = Box::new(f);
        self
    }

    pub fn on_connect(mut self, f: impl FnMut(Endpoint) + Send + 'static) -> Self {
        self.on_connect = Box::new(f);
        self
    }

    pub fn on_disconnect(mut self, f: impl FnMut(Endpoint) + Send + 'static) -> Self {
        self.on_disconnect = Box::new(f);
        self
    }

    pub fn on_unreliable_receive(mut self, f: impl FnMut(Endpoint, Vec<u8>) + Send + 'static) -> Self {
        self.on_unreliable_receive = Box::new(f);
        self
    }

    pub fn on_reliable_receive(mut self, f: impl FnMut(Endpoint, Vec<u8>) + Send + 'static) -> Self {
        self.on_reliable_receive = Box::new(f);
        self
    }
}

/// Resolve `requested` to a concrete port. `0` means "ask the OS once, then
/// reuse whatever it picked for every subsequent bind" — three independent
/// `bind(0)` calls would each get a different ephemeral port, breaking the
/// shared-port requirement.
fn resolve_shared_port(family: Family, requested: u16) -> io::Result<u16> {
    if requested != 0 {
        return Ok(requested);
    }
    let probe = sockopt::bind_stream_socket(family, 0)?;
    let addr = probe
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::other("bound probe address was not a socket address"))?;
    Ok(addr.port())
}

/// Owns one NAT hole-punching endpoint: a shared local port used for TCP
/// listening, TCP hole-punch dialing and UDP, plus the set of live
/// connections reached through it.
pub struct Server {
    family: Family,
    port: u16,
    listener: Listener,
    udp: Arc<UdpEndpoint>,
    holepuncher: HolePuncher,
    registry: ConnectionRegistry,
    closed: bool,
    on_hole_punch_fail: HolePunchFailFn,
    on_connect: ConnectFn,
    on_disconnect: DisconnectFn,
    on_unreliable_receive: UnreliableReceiveFn,
    on_reliable_receive: ReliableReceiveFn,
}

impl Server {
    pub fn new(config: ServerConfig) -> io::Result<Self> {
        let ServerConfig {
            family,
            port,
            listen,
            stun_hosts,
            on_hole_punch_fail,
            on_connect,
            on_disconnect,
            on_unreliable_receive,
            on_reliable_receive,
        } = config;

        let port = resolve_shared_port(family, port)?;
        let listener = Listener::new(family, port, listen)?;
        let stun_client = StunClient::new(stun_hosts);
        let udp = Arc::new(UdpEndpoint::new(family, port, &stun_client)?);
        let holepuncher = HolePuncher::new(family, port);
        let registry = ConnectionRegistry::new();

        Ok(Self {
            family,
            port,
            listener,
            udp,
            holepuncher,
            registry,
            closed: false,
            on_hole_punch_fail,
            on_connect,
            on_disconnect,
            on_unreliable_receive,
            on_reliable_receive,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// The shared local port every component of this Server binds to.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn get_local_endpoint(&self) -> Endpoint {
        self.udp.local_endpoint()
    }

    /// `None` if STUN discovery found no external mapping (total STUN
    /// failure is not fatal, §7).
    pub fn get_external_endpoint(&self) -> Option<Endpoint> {
        self.udp.external_endpoint()
    }

    /// Open a throwaway datagram socket sharing this Server's port (via the
    /// same `SO_REUSEADDR`/`SO_REUSEPORT` recipe every other component on
    /// this port uses), `connect()` it to `destination`, and read back the
    /// local address the kernel picked for that route. No packet is ever
    /// sent — UDP `connect` only records a default peer and resolves a
    /// route — so this is safe to call at any time. `None` on any failure
    /// along the way (binding the probe, resolving `destination`, or
    /// reading the route back), matching the original's bare
    /// `except: return None`.
    fn routed_local_endpoint(&self, destination: &str, port: u16, broadcast: bool) -> Option<Endpoint> {
        let raw = sockopt::bind_dgram_socket(self.family, self.port).ok()?;
        if broadcast {
            if let Err(err) = raw.set_broadcast(true) {
                tracing::debug!("could not set SO_BROADCAST on LAN-probe socket: {err}");
            }
        }
        let socket: UdpSocket = raw.into();
        let dest = endpoint::resolve(destination, port, self.family)?;
        socket.connect(dest.to_socket_addr()).ok()?;
        canonicalize(socket.local_addr().ok()?, self.family)
    }

    /// The address this Server would be reached at over the loopback
    /// interface, learned by `connect`-ing a throwaway socket to the
    /// loopback address on this Server's shared port (§4.7).
    pub fn get_loopback_endpoint(&self) -> Option<Endpoint> {
        let host = match self.family {
            Family::V4 => "127.0.0.1",
            Family::V6 => "::1",
        };
        self.routed_local_endpoint(host, 2000, false)
    }

    /// The address this Server would be reached at over the LAN, learned by
    /// `connect`-ing a throwaway socket to the IPv4 limited broadcast
    /// address on this Server's shared port (§4.7) — the same recipe used
    /// for loopback, with `SO_BROADCAST` set since some kernels refuse a
    /// route lookup against a broadcast destination otherwise.
    pub fn get_lan_endpoint(&self) -> Option<Endpoint> {
        self.routed_local_endpoint("255.255.255.255", 2000, true)
    }

    /// Resolve `host:port` to this Server's family and start (or restart) a
    /// TCP simultaneous-open attempt against it, blocking on `connect` for up
    /// to `timeout`. A no-op if already connected to this peer, if one is
    /// already in flight (call `stop_hole_punch` first to retry), or if
    /// `host` does not resolve / is not representable in this Server's
    /// family — resolution failure is a sentinel outcome, not an error (§7).
    pub fn hole_punch(&mut self, host: &str, port: u16, timeout: Duration) -> bool {
        if self.closed {
            return false;
        }
        let Some(endpoint) = endpoint::resolve(host, port, self.family) else {
            tracing::debug!("hole_punch to {host}:{port} could not be resolved, ignoring");
            return false;
        };
        if self.registry.contains(&endpoint) {
            return false;
        }
        self.holepuncher.hole_punch(endpoint, timeout);
        true
    }

    /// Same resolution rules as [`Server::hole_punch`]; a no-op, not an
    /// error, if `host` does not resolve or no attempt is in flight.
    pub fn stop_hole_punch(&mut self, host: &str, port: u16) -> bool {
        if self.closed {
            return false;
        }
        let Some(endpoint) = endpoint::resolve(host, port, self.family) else {
            tracing::debug!("stop_hole_punch to {host}:{port} could not be resolved, ignoring");
            return false;
        };
        self.holepuncher.remove_hole_puncher(&endpoint);
        true
    }

    pub fn is_connected(&self, endpoint: &Endpoint) -> bool {
        self.registry.contains(endpoint)
    }

    pub fn connected_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.registry.endpoints()
    }

    pub fn send_reliable(&mut self, endpoint: &Endpoint, data: &[u8]) -> bool {
        self.registry.send_reliable(endpoint, data)
    }

    pub fn send_unreliable(&self, endpoint: &Endpoint, data: &[u8]) -> bool {
        self.registry.send_unreliable(endpoint, data)
    }

    /// Drain every component once and dispatch this tick's events. Must be
    /// driven repeatedly by the embedder (e.g. once per frame, or in a tight
    /// loop on a dedicated thread) — there is no internal background loop.
    pub fn tick(&mut self) {
        if self.closed {
            return;
        }

        let mut fail_events = Vec::new();
        let mut connect_events = Vec::new();
        let mut disconnect_events;
        let mut unreliable_events = Vec::new();
        let reliable_events;

        // 1. Drain hole-punch fails.
        fail_events.extend(self.holepuncher.take_fails());

        // 2. Drain hole-punch successes; admit into the registry (may reject
        // a duplicate), removing the now-settled hole-puncher entry.
        for (remote, stream) in self.holepuncher.take_successes() {
            let Some(local) = local_endpoint_of(&stream, self.family) else {
                tracing::debug!("hole-punched stream's local address is not representable in this family");
                continue;
            };
            let connection = Connection::new(stream, Arc::clone(&self.udp), local, remote);
            if self.registry.add_connection(&self.udp, connection) {
                connect_events.push(remote);
            }
        }

        // 3. Drain the listener's newly accepted sockets; admit the same
        // way, cancelling any now-redundant in-flight hole-punch to the same
        // peer (the listener/hole-punch race is resolved by whichever side
        // the registry sees first within this tick).
        for stream in self.listener.take_new_connections() {
            if let Err(err) = stream.set_nonblocking(true) {
                tracing::debug!("accepted stream could not be set non-blocking: {err}");
                continue;
            }
            let (Some(local), Some(remote)) = (
                local_endpoint_of(&stream, self.family),
                remote_endpoint_of(&stream, self.family),
            ) else {
                tracing::debug!("accepted stream's address is not representable in this family");
                continue;
            };
            self.holepuncher.remove_hole_puncher(&remote);
            let connection = Connection::new(stream, Arc::clone(&self.udp), local, remote);
            if self.registry.add_connection(&self.udp, connection) {
                connect_events.push(remote);
            }
        }

        // 4. Drain UDP datagrams; only ones from a registered peer count.
        while let Some((from, data)) = self.udp.receive() {
            if self.registry.contains(&from) {
                unreliable_events.push((from, data));
            } else {
                tracing::trace!("discarding datagram from unregistered endpoint {from}");
            }
        }

        // 5. Drain reliable reads, 6. drain disconnects.
        let (reads, disconnects) = self.registry.drain_reliable(&self.udp);
        reliable_events = reads;
        disconnect_events = Vec::new();
        disconnect_events.extend(disconnects);

        // Dispatch in fixed order, with nothing locked.
        for endpoint in fail_events {
            (self.on_hole_punch_fail)(endpoint);
        }
        for endpoint in connect_events {
            (self.on_connect)(endpoint);
        }
        for endpoint in disconnect_events {
            (self.on_disconnect)(endpoint);
        }
        for (endpoint, data) in unreliable_events {
            (self.on_unreliable_receive)(endpoint, data);
        }
        for (endpoint, data) in reliable_events {
            (self.on_reliable_receive)(endpoint, data);
        }
    }

    /// Idempotent teardown: cancels in-flight hole punches, disconnects
    /// every peer, stops accepting, and stops the UDP keep-alive thread.
    /// Once this returns, `hole_punch`/`stop_hole_punch` are permanent
    /// no-ops and `tick` delivers no further callbacks (§3, invariant 3).
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.holepuncher.close();
        self.registry.disconnect_all(&self.udp);
        self.listener.close();
        match Arc::get_mut(&mut self.udp) {
            Some(udp) => udp.close(),
            None => tracing::debug!("UDP endpoint still shared; keep-alive thread left running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    // Scenario-level behavior (loopback hole punch, listener-only accept,
    // duplicate suppression) lives in tests/ alongside the rest of the
    // integration suite; these stay unit-scoped to this module's own surface.

    #[test]
    fn loopback_and_config_defaults_are_sane() {
        let server = Server::new(ServerConfig::new(Family::V4, 0).stun_hosts(Vec::new())).unwrap();
        assert!(matches!(server.get_loopback_endpoint(), Some(Endpoint::V4 { .. })));
        assert_eq!(server.get_external_endpoint(), None);
    }

    #[test]
    fn hole_punch_to_unresolvable_host_is_a_no_op() {
        let mut server =
            Server::new(ServerConfig::new(Family::V4, free_port()).stun_hosts(Vec::new())).unwrap();
        assert!(!server.hole_punch("not-a-real-host.invalid", 1234, Duration::from_millis(50)));
        assert!(!server.stop_hole_punch("not-a-real-host.invalid", 1234));
    }

    #[test]
    fn closed_server_rejects_hole_punch_and_ticks_do_nothing() {
        let mut server =
            Server::new(ServerConfig::new(Family::V4, free_port()).stun_hosts(Vec::new())).unwrap();
        server.close();
        server.close(); // idempotent

        assert!(!server.hole_punch("127.0.0.1", free_port(), Duration::from_millis(50)));
        assert!(!server.stop_hole_punch("127.0.0.1", 1234));
        server.tick(); // must not panic or touch already-closed components
    }
}
