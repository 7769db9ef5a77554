//! Shared-port UDP endpoint: datagram send/receive plus a background
//! keep-alive loop that stops the local NAT mapping from expiring even when
//! no peer is currently registered (§4.4, "Shared resources").

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::endpoint::{self, canonicalize, Endpoint, Family};
use crate::sockopt;
use crate::stun::StunClient;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEP_ALIVE_POLL: Duration = Duration::from_millis(250);

/// `192.0.2.1:2000`, from the TEST-NET-1 documentation range — never a real
/// peer, never removable by a caller, kept in the target set permanently so
/// the keep-alive loop always has somewhere to send even with zero
/// registered connections.
fn dummy_endpoint(family: Family) -> Endpoint {
    let v4 = SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 2000));
    canonicalize(v4, family).expect("192.0.2.1 is representable in every family")
}

/// A bound UDP socket shared by every peer connection, plus the state needed
/// to keep its NAT mapping alive and to report this host's address as seen
/// from inside and outside the NAT.
pub struct UdpEndpoint {
    socket: UdpSocket,
    family: Family,
    local_endpoint: Endpoint,
    external_endpoint: Option<Endpoint>,
    keep_alive_targets: Arc<Mutex<HashSet<Endpoint>>>,
    closed: Arc<AtomicBool>,
    keep_alive_handle: Option<JoinHandle<()>>,
}

impl UdpEndpoint {
    /// Bind the shared port, run STUN discovery while the socket is still
    /// blocking (§4.2), then switch it to non-blocking for ongoing polling
    /// and start the keep-alive thread.
    pub fn new(family: Family, port: u16, stun_client: &StunClient) -> io::Result<Self> {
        let raw = sockopt::bind_dgram_socket(family, port)?;
        let socket: UdpSocket = raw.into();

        let local_endpoint = endpoint::canonicalize(socket.local_addr()?, family).ok_or_else(|| {
            io::Error::other("bound UDP address is not representable in the configured family")
        })?;
        let external_endpoint = stun_client.discover(&socket, family);
        socket.set_nonblocking(true)?;

        let keep_alive_targets = Arc::new(Mutex::new(HashSet::from([dummy_endpoint(family)])));
        let closed = Arc::new(AtomicBool::new(false));
        let keep_alive_handle = spawn_keep_alive_thread(
            socket.try_clone()?,
            Arc::clone(&keep_alive_targets),
            Arc::clone(&closed),
        );

        Ok(Self {
            socket,
            family,
            local_endpoint,
            external_endpoint,
            keep_alive_targets,
            closed,
            keep_alive_handle: Some(keep_alive_handle),
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local_endpoint
    }

    /// `None` when every configured STUN host failed; not itself an error
    /// (§7) — a Server without a discovered external address can still
    /// hole-punch using LAN/loopback endpoints.
    pub fn external_endpoint(&self) -> Option<Endpoint> {
        self.external_endpoint
    }

    /// Send one datagram. Failures are routine (a send can fail if the
    /// remote NAT binding has already expired) and are reported as `false`,
    /// not propagated as an error. Silently drops once `close()` has run.
    pub fn send_to(&self, endpoint: Endpoint, data: &[u8]) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        match self.socket.send_to(data, endpoint.to_socket_addr()) {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!("UDP send to {endpoint} failed: {err}");
                false
            }
        }
    }

    /// Non-blocking receive of a single datagram. Returns `None` both when
    /// nothing is pending and when the read failed outright — callers drain
    /// the socket by calling this in a loop until it returns `None`. Always
    /// `None` once `close()` has run.
    ///
    /// A zero-length datagram is a keep-alive probe (§4.3), never data the
    /// application sent, and is dropped here rather than returned — the
    /// loop keeps reading so one or more keep-alives queued ahead of real
    /// data don't make the caller think the socket is empty.
    pub fn receive(&self) -> Option<(Endpoint, Vec<u8>)> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        let mut buf = [0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((0, _src)) => continue,
                Ok((len, src)) => {
                    let Some(endpoint) = canonicalize(src, self.family) else {
                        continue;
                    };
                    return Some((endpoint, buf[..len].to_vec()));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                Err(err) => {
                    tracing::debug!("UDP receive failed: {err}");
                    return None;
                }
            }
        }
    }

    /// Immediately send an empty keep-alive datagram to every registered
    /// target, independent of the background timer. Used right after a new
    /// peer is registered, so its NAT mapping does not wait up to 10 seconds
    /// for the first refresh.
    pub fn keep_alive(&self) {
        send_keep_alives(&self.socket, &self.keep_alive_targets);
    }

    /// Register `endpoint` as a keep-alive target and immediately send it a
    /// zero-length datagram, so its NAT mapping does not wait up to 10
    /// seconds for the first refresh from the background timer.
    pub fn add_keep_alive_target(&self, endpoint: Endpoint) {
        self.keep_alive_targets.lock().unwrap().insert(endpoint);
        self.send_to(endpoint, &[]);
    }

    pub fn remove_keep_alive_target(&self, endpoint: &Endpoint) {
        self.keep_alive_targets.lock().unwrap().remove(endpoint);
    }

    /// Idempotent: marks the endpoint closed, so subsequent `send_to`/
    /// `receive` calls are no-ops regardless of how many `Arc` handles to
    /// this endpoint are still alive, and cancels the keep-alive thread
    /// synchronously. The underlying socket is released when the last such
    /// handle is dropped, same as any other Rust resource.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(handle) = self.keep_alive_handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_keep_alive_thread(
    socket: UdpSocket,
    targets: Arc<Mutex<HashSet<Endpoint>>>,
    closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut elapsed = Duration::ZERO;
        while !closed.load(Ordering::Relaxed) {
            thread::sleep(KEEP_ALIVE_POLL);
            elapsed += KEEP_ALIVE_POLL;
            if elapsed >= KEEP_ALIVE_INTERVAL {
                elapsed = Duration::ZERO;
                send_keep_alives(&socket, &targets);
            }
        }
    })
}

fn send_keep_alives(socket: &UdpSocket, targets: &Mutex<HashSet<Endpoint>>) {
    let snapshot: Vec<Endpoint> = targets.lock().unwrap().iter().copied().collect();
    for endpoint in snapshot {
        if let Err(err) = socket.send_to(&[], endpoint.to_socket_addr()) {
            tracing::debug!("keep-alive send to {endpoint} failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn no_op_stun_client() -> StunClient {
        // An empty host list makes discovery a guaranteed, instant no-op,
        // keeping these tests independent of real network access.
        StunClient::new(Vec::new())
    }

    #[test]
    fn dummy_endpoint_present_on_construction() {
        let udp = UdpEndpoint::new(Family::V4, 0, &no_op_stun_client()).unwrap();
        assert!(udp
            .keep_alive_targets
            .lock()
            .unwrap()
            .contains(&dummy_endpoint(Family::V4)));
    }

    #[test]
    fn send_and_receive_round_trip() {
        let a = UdpEndpoint::new(Family::V4, 0, &no_op_stun_client()).unwrap();
        let b = UdpEndpoint::new(Family::V4, 0, &no_op_stun_client()).unwrap();

        assert!(a.send_to(b.local_endpoint(), b"hello"));

        let mut received = None;
        for _ in 0..200 {
            if let Some(datagram) = b.receive() {
                received = Some(datagram);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let (from, data) = received.expect("datagram never arrived");
        assert_eq!(data, b"hello");
        assert_eq!(from.port(), a.local_endpoint().port());
    }

    #[test]
    fn keep_alive_probe_is_dropped_not_delivered() {
        let a = UdpEndpoint::new(Family::V4, 0, &no_op_stun_client()).unwrap();
        let b = UdpEndpoint::new(Family::V4, 0, &no_op_stun_client()).unwrap();

        // A zero-length datagram followed immediately by a real one:
        // receive() must skip the former and hand back the latter, not stop
        // at the first (empty) read and report the socket as idle.
        assert!(a.send_to(b.local_endpoint(), b""));
        assert!(a.send_to(b.local_endpoint(), b"real"));

        let mut received = None;
        for _ in 0..200 {
            if let Some(datagram) = b.receive() {
                received = Some(datagram);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let (_, data) = received.expect("real datagram never arrived");
        assert_eq!(data, b"real");
    }

    #[test]
    fn receive_drains_to_none_when_empty() {
        let udp = UdpEndpoint::new(Family::V4, 0, &no_op_stun_client()).unwrap();
        assert!(udp.receive().is_none());
    }

    #[test]
    fn external_endpoint_absent_with_no_stun_hosts() {
        let udp = UdpEndpoint::new(Family::V4, 0, &no_op_stun_client()).unwrap();
        assert_eq!(udp.external_endpoint(), None);
    }

    #[test]
    fn add_and_remove_keep_alive_target() {
        let mut udp = UdpEndpoint::new(Family::V4, 0, &no_op_stun_client()).unwrap();
        let target = Endpoint::V4 {
            addr: Ipv4Addr::new(127, 0, 0, 1),
            port: 4242,
        };
        udp.add_keep_alive_target(target);
        assert!(udp.keep_alive_targets.lock().unwrap().contains(&target));
        udp.remove_keep_alive_target(&target);
        assert!(!udp.keep_alive_targets.lock().unwrap().contains(&target));
        udp.close();
    }
}
