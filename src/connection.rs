//! One established peer connection: a connected TCP stream for reliable
//! delivery, plus the shared [`UdpEndpoint`] and the peer's endpoint for
//! unreliable (datagram) delivery (§4.6).

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::udp::UdpEndpoint;

/// Outcome of one non-blocking poll of a Connection's TCP side.
pub enum ReliableRead {
    Data(Vec<u8>),
    NoData,
    /// Either a zero-length read (clean EOF) or any other read error.
    /// POSIX "exception-ready" has no non-blocking-socket analogue here; any
    /// error other than `WouldBlock` is treated the same as a graceful
    /// close, per §4.6.
    Disconnected,
}

/// A connected peer, reachable both by TCP (reliable) and, via the shared
/// UDP socket, by datagram (unreliable).
pub struct Connection {
    tcp_socket: TcpStream,
    udp: Arc<UdpEndpoint>,
    local_endpoint: Endpoint,
    remote_endpoint: Endpoint,
    closed: bool,
}

impl Connection {
    pub fn new(
        tcp_socket: TcpStream,
        udp: Arc<UdpEndpoint>,
        local_endpoint: Endpoint,
        remote_endpoint: Endpoint,
    ) -> Self {
        Self {
            tcp_socket,
            udp,
            local_endpoint,
            remote_endpoint,
            closed: false,
        }
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local_endpoint
    }

    pub fn remote_endpoint(&self) -> Endpoint {
        self.remote_endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send over TCP. A partial write is completed with `write_all`, so
    /// callers never see a short write — only success or failure.
    pub fn send_reliable(&mut self, data: &[u8]) -> bool {
        if self.closed {
            return false;
        }
        match self.tcp_socket.write_all(data) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!("reliable send to {} failed, closing: {err}", self.remote_endpoint);
                self.close();
                false
            }
        }
    }

    /// Send over the shared UDP socket to this peer's endpoint.
    pub fn send_unreliable(&self, data: &[u8]) -> bool {
        if self.closed {
            return false;
        }
        self.udp.send_to(self.remote_endpoint, data)
    }

    /// Non-blocking poll of the TCP side. Callers loop on this until it
    /// returns anything other than `Data` to drain everything pending this
    /// tick.
    pub fn poll_reliable(&mut self) -> ReliableRead {
        if self.closed {
            return ReliableRead::Disconnected;
        }
        let mut buf = [0u8; 65536];
        match self.tcp_socket.read(&mut buf) {
            Ok(0) => ReliableRead::Disconnected,
            Ok(n) => ReliableRead::Data(buf[..n].to_vec()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => ReliableRead::NoData,
            Err(err) => {
                tracing::debug!("reliable read from {} failed: {err}", self.remote_endpoint);
                ReliableRead::Disconnected
            }
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.tcp_socket.shutdown(std::net::Shutdown::Both) {
            tracing::debug!("shutdown of connection to {} failed: {err}", self.remote_endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{canonicalize, Family};
    use crate::stun::StunClient;
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    fn fresh_connection(socket: TcpStream) -> Connection {
        let udp = Arc::new(UdpEndpoint::new(Family::V4, 0, &StunClient::new(Vec::new())).unwrap());
        let local = canonicalize(socket.local_addr().unwrap(), Family::V4).unwrap();
        let remote = canonicalize(socket.peer_addr().unwrap(), Family::V4).unwrap();
        Connection::new(socket, udp, local, remote)
    }

    #[test]
    fn reliable_send_then_poll_round_trip() {
        let (a, b) = connected_pair();
        let mut conn_a = fresh_connection(a);
        let mut conn_b = fresh_connection(b);

        assert!(conn_a.send_reliable(b"ping"));

        let mut got = None;
        for _ in 0..200 {
            match conn_b.poll_reliable() {
                ReliableRead::Data(data) => {
                    got = Some(data);
                    break;
                }
                ReliableRead::NoData => std::thread::sleep(std::time::Duration::from_millis(10)),
                ReliableRead::Disconnected => panic!("unexpected disconnect"),
            }
        }
        assert_eq!(got.unwrap(), b"ping");
    }

    #[test]
    fn poll_reports_no_data_when_idle() {
        let (a, b) = connected_pair();
        let _conn_a = fresh_connection(a);
        let mut conn_b = fresh_connection(b);
        assert!(matches!(conn_b.poll_reliable(), ReliableRead::NoData));
    }

    #[test]
    fn peer_shutdown_is_observed_as_disconnect() {
        let (a, b) = connected_pair();
        let mut conn_a = fresh_connection(a);
        let conn_b = fresh_connection(b);
        conn_b.tcp_socket.shutdown(std::net::Shutdown::Both).unwrap();
        drop(conn_b);

        let mut disconnected = false;
        for _ in 0..200 {
            if matches!(conn_a.poll_reliable(), ReliableRead::Disconnected) {
                disconnected = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(disconnected);
    }

    #[test]
    fn closed_connection_refuses_sends() {
        let (a, _b) = connected_pair();
        let mut conn = fresh_connection(a);
        conn.close();
        assert!(!conn.send_reliable(b"x"));
        assert!(!conn.send_unreliable(b"x"));
        assert!(matches!(conn.poll_reliable(), ReliableRead::Disconnected));
    }

    #[test]
    fn failed_reliable_send_marks_connection_closed() {
        let (a, b) = connected_pair();
        let mut conn = fresh_connection(a);
        drop(b);

        // A TCP peer that has fully gone away (dropped, not just
        // half-shutdown) eventually answers further writes with a reset;
        // keep writing until the kernel reports it.
        let mut failed = false;
        for _ in 0..200 {
            if !conn.send_reliable(b"x") {
                failed = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(failed, "send_reliable never observed the dropped peer");
        assert!(conn.is_closed());
        assert!(matches!(conn.poll_reliable(), ReliableRead::Disconnected));
    }
}
