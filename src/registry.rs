//! Owns every live [`Connection`], keyed by remote endpoint, and the
//! bookkeeping needed to poll all of them for reliable data once per tick
//! (§4.6, §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::{Connection, ReliableRead};
use crate::endpoint::Endpoint;
use crate::udp::UdpEndpoint;

/// The set of currently connected peers.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<Endpoint, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.connections.contains_key(endpoint)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.connections.keys()
    }

    /// Register a newly established connection. If one already exists for
    /// this remote endpoint — a listener accept and a hole-punch success
    /// racing to the same peer within one tick, for instance — the new
    /// socket is closed and discarded and the existing connection is kept
    /// (§8, scenario S5: admission is at-most-once per endpoint).
    pub fn add_connection(&mut self, udp: &Arc<UdpEndpoint>, mut connection: Connection) -> bool {
        let remote = connection.remote_endpoint();
        if self.connections.contains_key(&remote) {
            tracing::debug!("duplicate connection admission for {remote} discarded");
            connection.close();
            return false;
        }
        udp.add_keep_alive_target(remote);
        self.connections.insert(remote, connection);
        true
    }

    pub fn send_reliable(&mut self, endpoint: &Endpoint, data: &[u8]) -> bool {
        match self.connections.get_mut(endpoint) {
            Some(connection) => connection.send_reliable(data),
            None => false,
        }
    }

    pub fn send_unreliable(&self, endpoint: &Endpoint, data: &[u8]) -> bool {
        match self.connections.get(endpoint) {
            Some(connection) => connection.send_unreliable(data),
            None => false,
        }
    }

    /// Non-blocking drain of every connection's TCP side. First evicts any
    /// connection whose `closed` flag was already set externally (e.g. by a
    /// failed `send_reliable`) without touching its socket again, then polls
    /// everything else for reads and read-side disconnects. Returns every
    /// `(endpoint, payload)` read this pass, and every endpoint observed to
    /// disconnect (by either path) — those connections are closed and
    /// removed (including from the shared UDP keep-alive target set) before
    /// this returns.
    pub fn drain_reliable(&mut self, udp: &Arc<UdpEndpoint>) -> (Vec<(Endpoint, Vec<u8>)>, Vec<Endpoint>) {
        let mut reads = Vec::new();
        let mut disconnected = Vec::new();

        for (&endpoint, connection) in self.connections.iter_mut() {
            if connection.is_closed() {
                disconnected.push(endpoint);
                continue;
            }
            loop {
                match connection.poll_reliable() {
                    ReliableRead::Data(data) => reads.push((endpoint, data)),
                    ReliableRead::NoData => break,
                    ReliableRead::Disconnected => {
                        disconnected.push(endpoint);
                        break;
                    }
                }
            }
        }

        for endpoint in &disconnected {
            if let Some(mut connection) = self.connections.remove(endpoint) {
                connection.close();
            }
            udp.remove_keep_alive_target(endpoint);
        }

        (reads, disconnected)
    }

    /// Close and drop every connection, e.g. during Server teardown.
    pub fn disconnect_all(&mut self, udp: &Arc<UdpEndpoint>) {
        for (endpoint, mut connection) in self.connections.drain() {
            connection.close();
            udp.remove_keep_alive_target(&endpoint);
        }
    }
}
